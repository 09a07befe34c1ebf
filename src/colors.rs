//! Implements ANSI foreground colors for printable types

use core::marker::PhantomData;

/// Wrapper struct for generically selecting a color over something to be printed
pub struct Styled<'a, T: Sized, C> {
    /// Original data to stylize
    original: &'a T,

    /// Color of the text
    color: PhantomData<C>,
}

/// Trait which provides the ANSI color string
pub trait Color {
    /// The ANSI color string for this color
    const ANSI: &'static str;
}

/// Creates structs for each ANSI color and implemented the [`Color`] trait for them
macro_rules! create_color {
    ($color:ident, $num:expr) => {
        pub struct $color;

        impl Color for $color {
            const ANSI: &'static str = concat!("\x1b[", stringify!($num), "m");
        }
    };
}

create_color!(Red, 31);
create_color!(Green, 32);
create_color!(Yellow, 33);
create_color!(Cyan, 36);
create_color!(Normal, 39);

/// Implements the various `core::fmt` traits
macro_rules! impl_formats {
    ($ty:path) => {
        impl<'a, T: $ty, C: Color> $ty for Styled<'a, T, C> {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(C::ANSI)?;
                <T as $ty>::fmt(&self.original, f)?;
                f.write_str(Normal::ANSI)
            }
        }
    };
}

/// Implements each function that is available for adding color
macro_rules! trait_func {
    ($color:ident, $ty:ident) => {
        fn $color(&self) -> Styled<Self, $ty>
        where
            Self: Sized,
        {
            Styled {
                original: self,
                color: PhantomData,
            }
        }
    };
}

/// Provides wrapper functions to apply foreground colors
pub trait Colorized {
    trait_func!(red, Red);
    trait_func!(green, Green);
    trait_func!(yellow, Yellow);
    trait_func!(cyan, Cyan);
}

impl_formats!(core::fmt::Display);
impl_formats!(core::fmt::LowerHex);

impl<T: core::fmt::Display> Colorized for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_in_ansi_codes() {
        assert_eq!(format!("{}", "ok".green()), "\x1b[32mok\x1b[39m");
        assert_eq!(format!("{:02x}", 0x38_u8.red()), "\x1b[31m38\x1b[39m");
    }
}
