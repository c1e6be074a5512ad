//! Base definitions for entity types.

use super::packed_option::ReservedValue;

/// A typed wrapper around an integer index.
///
/// Types implementing this trait can be used as keys for collections like
/// [`PrimaryMap`].
///
/// [`PrimaryMap`]: super::PrimaryMap
pub trait EntityRef: Copy + Eq + ReservedValue {
    /// Creates a new entity reference from a raw index.
    fn new(index: usize) -> Self;

    /// Returns the index that was used to create this entity reference.
    fn index(self) -> usize;
}

/// Internal helper macro to define a new entity type along with some trait
/// implementations.
macro_rules! entity_def {
    ($($(#[$attr:meta])* $vis:vis entity $name:ident($int:ident);)*) => {
        $(
            $(#[$attr])*
            #[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
            $vis struct $name($int);

            // Inherent copies of the EntityRef methods that are const.
            impl $name {
                /// Creates a new entity reference from a raw index.
                #[inline]
                #[allow(dead_code)]
                $vis const fn new(index: usize) -> Self {
                    debug_assert!(index < ($int::MAX as usize));
                    Self(index as $int)
                }

                /// Returns the index that was used to create this entity reference.
                #[inline]
                #[allow(dead_code)]
                $vis const fn index(self) -> usize {
                    self.0 as usize
                }
            }

            impl $crate::entity::EntityRef for $name {
                #[inline]
                fn new(index: usize) -> Self {
                    debug_assert!(index < ($int::MAX as usize));
                    $name(index as $int)
                }

                #[inline]
                fn index(self) -> usize {
                    self.0 as usize
                }
            }

            impl $crate::entity::ReservedValue for $name {
                #[inline]
                fn reserved_value() -> Self {
                    Self($int::MAX)
                }

                #[inline]
                fn is_reserved_value(&self) -> bool {
                    self.0 == $int::MAX
                }
            }
        )*
    };

    // Same as above but also provides Display/Debug impls.
    ($($(#[$attr:meta])* $vis:vis entity $name:ident($int:ident, $display_prefix:expr);)*) => {
        entity_def! {
            $($(#[$attr])* $vis entity $name($int);)*
        }
        $(
            impl core::fmt::Display for $name {
                fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                    write!(f, concat!($display_prefix, "{}"), self.0)
                }
            }

            impl core::fmt::Debug for $name {
                fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                    core::fmt::Display::fmt(self, f)
                }
            }
        )*
    };
}
