//! Conversion between Rust values and hub argument lists.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::HubError;

/// Argument shape of a push-event handler.
///
/// Implemented for tuples of up to four deserializable values. The arity is
/// checked before any argument is decoded, so a frame with the wrong number
/// of arguments never reaches the handler.
pub trait HubArgs: Sized {
    /// Number of arguments the handler expects.
    const ARITY: usize;

    /// Decodes the argument list. The caller has already checked the arity.
    fn from_arguments(arguments: Vec<Value>) -> Result<Self, HubError>;
}

macro_rules! impl_hub_args {
    ($arity:expr; $($ty:ident),*) => {
        impl<$($ty: DeserializeOwned),*> HubArgs for ($($ty,)*) {
            const ARITY: usize = $arity;

            #[allow(unused_mut, unused_variables)]
            fn from_arguments(arguments: Vec<Value>) -> Result<Self, HubError> {
                if arguments.len() != Self::ARITY {
                    return Err(HubError::InvalidArguments(format!(
                        "expected {} argument(s), got {}",
                        Self::ARITY,
                        arguments.len()
                    )));
                }
                let mut values = arguments.into_iter();
                Ok(($(
                    serde_json::from_value::<$ty>(values.next().unwrap_or(Value::Null))
                        .map_err(|e| HubError::InvalidArguments(e.to_string()))?,
                )*))
            }
        }
    };
}

impl_hub_args!(0;);
impl_hub_args!(1; A);
impl_hub_args!(2; A, B);
impl_hub_args!(3; A, B, C);
impl_hub_args!(4; A, B, C, D);

/// Serializes call arguments into an ordered argument list.
///
/// Pass a tuple: `("Alice", 3)` becomes two arguments, `()` none. A lone
/// non-sequence value counts as a single argument.
pub fn to_arguments<A: Serialize>(args: A) -> Result<Vec<Value>, HubError> {
    match serde_json::to_value(args)? {
        Value::Null => Ok(Vec::new()),
        Value::Array(values) => Ok(values),
        single => Ok(vec![single]),
    }
}
