//! Typed physical and virtual addresses.
//!
//! The kernel targets 32-bit protected mode, so the raw representation is
//! `u32` throughout. The phantom type parameter keeps physical and virtual
//! address arithmetic from mixing.

use core::cmp::Ordering;
use core::fmt::Debug;
use core::hash::Hash;
use core::marker::PhantomData;
use core::ops::{Add, AddAssign, Sub, SubAssign};

pub trait AddressType: Clone + Copy + Eq + Ord + PartialEq + PartialOrd + Debug + Hash {}

#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd, Debug, Hash)]
pub struct PhysAddressType;

#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd, Debug, Hash)]
pub struct VirtAddressType;

impl AddressType for PhysAddressType {}
impl AddressType for VirtAddressType {}

#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct Address<Type: AddressType>(u32, PhantomData<Type>);

pub type PhysAddress = Address<PhysAddressType>;
pub type VirtAddress = Address<VirtAddressType>;

impl<Type: AddressType> Address<Type> {
    pub const fn from_raw(val: u32) -> Self {
        Self(val, PhantomData)
    }

    pub const fn zero() -> Self {
        Self::from_raw(0)
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub const fn as_raw(self) -> u32 {
        self.0
    }

    pub const fn from_zero(offset: Length) -> Self {
        Self::from_raw(offset.as_raw())
    }

    pub fn offset_by_checked(self, length: Length) -> Option<Self> {
        Some(Self(self.0.checked_add(length.0)?, PhantomData))
    }

    pub const fn is_aligned_to(self, alignment: u32) -> bool {
        self.0 == self.align_down(alignment).0
    }

    /// Returns the last address at or below `self` that is aligned to
    /// `alignment`, which must be a power of two.
    pub const fn align_down(self, alignment: u32) -> Self {
        Self::from_raw(align_u32_down(self.as_raw(), alignment))
    }

    /// Returns the first address at or above `self` that is aligned to
    /// `alignment`, which must be a power of two.
    pub const fn align_up(self, alignment: u32) -> Self {
        Self::from_raw(align_u32_up(self.as_raw(), alignment))
    }
}

impl<Type: AddressType> Ord for Address<Type> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl<Type: AddressType> PartialOrd for Address<Type> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<Type: AddressType> Debug for Address<Type> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}({:#010x})", core::any::type_name::<Type>(), self.0)
    }
}

impl<Type: AddressType> Add<Length> for Address<Type> {
    type Output = Self;
    fn add(self, rhs: Length) -> Self {
        self.offset_by_checked(rhs).unwrap()
    }
}

impl<Type: AddressType> AddAssign<Length> for Address<Type> {
    fn add_assign(&mut self, rhs: Length) {
        *self = *self + rhs;
    }
}

impl<Type: AddressType> Sub<Length> for Address<Type> {
    type Output = Self;
    fn sub(self, rhs: Length) -> Self {
        Self(self.0.checked_sub(rhs.0).unwrap(), PhantomData)
    }
}

impl<Type: AddressType> SubAssign<Length> for Address<Type> {
    fn sub_assign(&mut self, rhs: Length) {
        *self = *self - rhs;
    }
}

impl<Type: AddressType> Sub<Self> for Address<Type> {
    type Output = Length;
    fn sub(self, rhs: Self) -> Length {
        Length(self.0.checked_sub(rhs.0).unwrap())
    }
}

/// A byte count with the same alignment helpers as addresses.
#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd, Debug, Hash)]
pub struct Length(u32);

impl Length {
    pub const fn from_raw(val: u32) -> Self {
        Length(val)
    }

    pub const fn as_raw(self) -> u32 {
        self.0
    }

    pub const fn align_up(self, alignment: u32) -> Self {
        Length(align_u32_up(self.0, alignment))
    }

    pub const fn is_aligned_to(self, alignment: u32) -> bool {
        self.0 % alignment == 0
    }
}

impl Add for Length {
    type Output = Length;
    fn add(self, rhs: Length) -> Length {
        Length(self.0.checked_add(rhs.0).unwrap())
    }
}

impl Sub for Length {
    type Output = Length;
    fn sub(self, rhs: Length) -> Length {
        Length(self.0.checked_sub(rhs.0).unwrap())
    }
}

/// A contiguous, non-empty range of addresses.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Hash)]
pub struct Extent<Type: AddressType> {
    address: Address<Type>,
    length: Length,
}

pub type PhysExtent = Extent<PhysAddressType>;
pub type VirtExtent = Extent<VirtAddressType>;

impl<Type: AddressType> Extent<Type> {
    /// # Panics
    ///
    /// Panics if `length` is zero or the extent wraps the address space.
    pub fn new(address: Address<Type>, length: Length) -> Self {
        assert!(length.as_raw() > 0);
        assert!(address.as_raw().checked_add(length.as_raw() - 1).is_some());
        Extent { address, length }
    }

    pub fn from_raw(address: u32, length: u32) -> Self {
        Self::new(Address::from_raw(address), Length::from_raw(length))
    }

    pub fn from_raw_range_exclusive(begin: u32, end: u32) -> Self {
        Self::from_raw(begin, end.checked_sub(begin).unwrap())
    }

    pub const fn address(self) -> Address<Type> {
        self.address
    }

    pub const fn length(self) -> Length {
        self.length
    }

    pub const fn last_address(self) -> Address<Type> {
        Address::from_raw(self.address.as_raw() + (self.length.as_raw() - 1))
    }

    /// One past the end; `None` if the extent ends at the top of the address
    /// space.
    pub fn end_address(self) -> Option<Address<Type>> {
        self.address.offset_by_checked(self.length)
    }

    pub fn contains(self, addr: Address<Type>) -> bool {
        addr >= self.address && addr <= self.last_address()
    }

    pub fn has_overlap(self, other: Self) -> bool {
        self.address <= other.last_address() && other.address <= self.last_address()
    }
}

pub const fn align_u32_down(val: u32, alignment: u32) -> u32 {
    val & !(alignment - 1)
}

pub const fn align_u32_up(val: u32, alignment: u32) -> u32 {
    (val.wrapping_add(alignment - 1)) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment() {
        let a = VirtAddress::from_raw(0x1234);
        assert_eq!(a.align_down(0x1000).as_raw(), 0x1000);
        assert_eq!(a.align_up(0x1000).as_raw(), 0x2000);
        assert!(VirtAddress::from_raw(0x3000).is_aligned_to(0x1000));
        assert!(!a.is_aligned_to(0x1000));
        assert_eq!(
            VirtAddress::from_raw(0x2000).align_up(0x1000).as_raw(),
            0x2000
        );
    }

    #[test]
    fn arithmetic() {
        let a = PhysAddress::from_raw(0x1000);
        let b = a + Length::from_raw(0x234);
        assert_eq!(b.as_raw(), 0x1234);
        assert_eq!((b - a).as_raw(), 0x234);
    }

    #[test]
    fn extents() {
        let e = PhysExtent::from_raw(0x1000, 0x2000);
        assert_eq!(e.last_address().as_raw(), 0x2FFF);
        assert_eq!(e.end_address().unwrap().as_raw(), 0x3000);
        assert!(e.contains(PhysAddress::from_raw(0x2FFF)));
        assert!(!e.contains(PhysAddress::from_raw(0x3000)));
        assert!(e.has_overlap(PhysExtent::from_raw(0x2FFF, 1)));
        assert!(!e.has_overlap(PhysExtent::from_raw(0x3000, 1)));
    }
}
