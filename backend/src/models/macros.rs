/// Declares `i64` row-id newtypes.
///
/// Each id serializes as a bare number, prints as one, parses from a path
/// segment and converts to and from `i64`.
///
/// ```ignore
/// define_ids!(
///     /// Primary key of a localization.
///     LocalizationId,
///     NoticeId,
/// );
/// ```
#[macro_export]
macro_rules! define_ids {
    ($($(#[$meta:meta])* $name:ident),+ $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(
                Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash,
                serde::Serialize, serde::Deserialize,
            )]
            #[serde(transparent)]
            pub struct $name(pub i64);

            impl $name {
                pub fn new(value: i64) -> Self {
                    Self(value)
                }

                pub fn value(&self) -> i64 {
                    self.0
                }
            }

            impl ::std::fmt::Display for $name {
                fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                    ::std::fmt::Display::fmt(&self.0, f)
                }
            }

            impl ::std::str::FromStr for $name {
                type Err = ::std::num::ParseIntError;

                fn from_str(s: &str) -> Result<Self, Self::Err> {
                    s.trim().parse().map(Self)
                }
            }

            impl From<i64> for $name {
                fn from(v: i64) -> Self {
                    Self(v)
                }
            }

            impl From<$name> for i64 {
                fn from(v: $name) -> Self {
                    v.0
                }
            }
        )+
    };
}
