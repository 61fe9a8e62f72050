//! Closed sum types with tag-checked access.
//!
//! [`one_of!`](crate::one_of) declares a plain Rust enum whose variants each wrap a distinct type,
//! and wires it up with a companion `Tag` enum, [`OneOf`] and one [`Alternative`] impl per
//! variant. Pattern matching on the enum stays the primary way to dispatch; the traits cover
//! generic code that only knows the alternative's type.
//!
//! ```
//! use horus_runtime::one_of::{Empty, OneOf};
//!
//! horus_runtime::one_of! {
//!     #[derive(Debug, Clone, PartialEq)]
//!     pub enum Payload {
//!         Nothing(Empty),
//!         Count(u32),
//!         Text(String),
//!     }
//! }
//!
//! let payload = Payload::from(7u32);
//! assert_eq!(payload.tag(), PayloadTag::Count);
//! assert_eq!(payload.get::<u32>(), Ok(&7));
//! assert!(payload.get::<String>().is_err());
//! ```

use std::{fmt, hash::Hash};

/// The unit alternative, for "no payload".
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Empty;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "miette", derive(miette::Diagnostic))]
#[error("expected alternative `{expected}`, found `{actual}`")]
pub struct WrongAlternative {
    pub expected: &'static str,
    pub actual: &'static str,
}

pub trait OneOf: Sized {
    type Tag: Copy + Eq + Hash + fmt::Debug;

    fn tag(&self) -> Self::Tag;

    /// Name of the active variant.
    fn alternative_name(&self) -> &'static str;

    fn is<T>(&self) -> bool
    where
        Self: Alternative<T>,
    {
        self.tag() == <Self as Alternative<T>>::TAG
    }

    fn get<T>(&self) -> Result<&T, WrongAlternative>
    where
        Self: Alternative<T>,
    {
        let actual = self.alternative_name();
        self.as_alternative().ok_or(WrongAlternative {
            expected: <Self as Alternative<T>>::NAME,
            actual,
        })
    }

    fn get_mut<T>(&mut self) -> Result<&mut T, WrongAlternative>
    where
        Self: Alternative<T>,
    {
        let actual = self.alternative_name();
        self.as_alternative_mut().ok_or(WrongAlternative {
            expected: <Self as Alternative<T>>::NAME,
            actual,
        })
    }

    /// Moves the `T` alternative out, or hands `self` back untouched.
    fn extract<T>(self) -> Result<T, Self>
    where
        Self: Alternative<T>,
    {
        self.into_alternative()
    }

    /// # Safety
    /// `self` must hold the `T` alternative, e.g. because [`OneOf::tag`] or a `match` already
    /// said so.
    unsafe fn get_unchecked<T>(&self) -> &T
    where
        Self: Alternative<T>,
    {
        match self.as_alternative() {
            Some(value) => value,
            // SAFETY: guaranteed by the caller.
            None => unsafe { std::hint::unreachable_unchecked() },
        }
    }
}

/// Implemented by a [`OneOf`] type once per alternative type `T`.
pub trait Alternative<T>: OneOf {
    const TAG: Self::Tag;
    const NAME: &'static str;

    fn as_alternative(&self) -> Option<&T>;
    fn as_alternative_mut(&mut self) -> Option<&mut T>;
    fn into_alternative(self) -> Result<T, Self>;
}

/// Declares a tagged variant. Each variant wraps exactly one type, and the types must be
/// distinct so that every alternative can be named by its type.
///
/// Generates the enum itself, a `<Name>Tag` enum with one fieldless variant per alternative, the
/// [`OneOf`](crate::one_of::OneOf) and [`Alternative`](crate::one_of::Alternative) impls, and
/// `From<T>` for every alternative type.
#[macro_export]
macro_rules! one_of {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($variant:ident($ty:ty)),+ $(,)?
        }
    ) => {
        $crate::__private::paste! {
            $(#[$meta])*
            $vis enum $name {
                $($variant($ty)),+
            }

            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            $vis enum [<$name Tag>] {
                $($variant),+
            }

            impl $crate::one_of::OneOf for $name {
                type Tag = [<$name Tag>];

                fn tag(&self) -> Self::Tag {
                    match self {
                        $(Self::$variant(_) => [<$name Tag>]::$variant),+
                    }
                }

                fn alternative_name(&self) -> &'static str {
                    match self {
                        $(Self::$variant(_) => stringify!($variant)),+
                    }
                }
            }

            $(
                impl $crate::one_of::Alternative<$ty> for $name {
                    const TAG: [<$name Tag>] = [<$name Tag>]::$variant;
                    const NAME: &'static str = stringify!($variant);

                    fn as_alternative(&self) -> Option<&$ty> {
                        match self {
                            Self::$variant(value) => Some(value),
                            #[allow(unreachable_patterns)]
                            _ => None,
                        }
                    }

                    fn as_alternative_mut(&mut self) -> Option<&mut $ty> {
                        match self {
                            Self::$variant(value) => Some(value),
                            #[allow(unreachable_patterns)]
                            _ => None,
                        }
                    }

                    fn into_alternative(self) -> Result<$ty, Self> {
                        match self {
                            Self::$variant(value) => Ok(value),
                            #[allow(unreachable_patterns)]
                            other => Err(other),
                        }
                    }
                }

                impl From<$ty> for $name {
                    fn from(value: $ty) -> Self {
                        Self::$variant(value)
                    }
                }
            )+
        }
    };
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc};

    use super::*;

    #[derive(Debug)]
    struct Tracked(Rc<Cell<usize>>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    crate::one_of! {
        #[derive(Debug)]
        enum Value {
            Nothing(Empty),
            Number(u64),
            Text(String),
            Resource(Tracked),
        }
    }

    crate::one_of! {
        #[derive(Debug, Clone, PartialEq)]
        enum Single {
            Only(u8),
        }
    }

    #[test]
    fn test_tag_tracks_active_alternative() {
        assert_eq!(Value::from(Empty).tag(), ValueTag::Nothing);
        assert_eq!(Value::from(3u64).tag(), ValueTag::Number);
        assert_eq!(Value::from("hi".to_string()).tag(), ValueTag::Text);
        let value = Value::from(3u64);
        assert!(value.is::<u64>());
        assert!(!value.is::<String>());
        assert_eq!(value.alternative_name(), "Number");
    }

    #[test]
    fn test_checked_access() {
        let mut value = Value::from("abc".to_string());
        assert_eq!(value.get::<String>().map(String::as_str), Ok("abc"));
        assert_eq!(
            value.get::<u64>(),
            Err(WrongAlternative {
                expected: "Number",
                actual: "Text",
            })
        );
        value.get_mut::<String>().unwrap().push('d');
        assert_eq!(unsafe { value.get_unchecked::<String>() }, "abcd");
    }

    #[test]
    fn test_extract_returns_self_on_mismatch() {
        let value = Value::from(9u64);
        let value = value.extract::<String>().unwrap_err();
        assert_eq!(value.extract::<u64>().unwrap(), 9);
    }

    #[test]
    fn test_drop_touches_only_active_alternative() {
        let drops = Rc::new(Cell::new(0));
        let value = Value::from(Tracked(drops.clone()));
        let moved = value;
        assert_eq!(drops.get(), 0);
        drop(moved);
        assert_eq!(drops.get(), 1);

        let value = Value::from(1u64);
        drop(value);
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn test_single_alternative() {
        let single = Single::from(4u8);
        assert_eq!(single.clone().extract::<u8>(), Ok(4));
        assert_eq!(single.tag(), SingleTag::Only);
    }
}
