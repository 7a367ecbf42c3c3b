use std::fmt;

use crate::identity::{FunctionDef, FunctionIdentity};

/// A function body together with the definition its identity comes from.
///
/// The body receives the bound arguments of a call. For synchronous plain
/// and sequence results it returns `anyhow::Result<T>`; for asynchronous
/// ones it returns a future of that. [`computation!`](crate::computation)
/// builds both from an ordinary function item.
#[derive(Clone)]
pub struct Computation<F> {
    def: FunctionDef,
    body: F,
}

impl<F> Computation<F> {
    pub fn new(def: FunctionDef, body: F) -> Self {
        Self { def, body }
    }

    pub fn def(&self) -> &FunctionDef {
        &self.def
    }

    pub fn identity(&self) -> &FunctionIdentity {
        self.def.identity()
    }

    pub fn body(&self) -> &F {
        &self.body
    }
}

impl<F> fmt::Debug for Computation<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computation")
            .field("def", &self.def)
            .finish_non_exhaustive()
    }
}

/// Declares a function and captures it as a [`Computation`].
///
/// The function's name, file, parameters and source text become its
/// identity. Parameters bind positionally or by name and may carry a default
/// after `=`. Parameter types must be owned and deserializable.
///
/// ```
/// use cachestore::computation;
///
/// let scale = computation! {
///     fn scale(value: i64, factor: i64 = 2) -> i64 {
///         value * factor
///     }
/// };
/// assert_eq!(scale.def().signature().to_string(), "(value, factor=2)");
/// ```
#[macro_export]
macro_rules! computation {
    (
        $(#[$meta:meta])*
        async fn $name:ident ( $($param:ident : $ty:ty $(= $default:expr)?),* $(,)? ) -> $ret:ty $body:block
    ) => {{
        $(#[$meta])*
        async fn $name($($param: $ty),*) -> $ret $body

        $crate::Computation::new(
            $crate::computation!(@def $name, async fn $name($($param: $ty),*) -> $ret $body, $($param $(= $default)?),*),
            move |args: $crate::BoundArguments| async move {
                ::core::result::Result::<_, $crate::ComputationError>::Ok(
                    $name($(args.get::<$ty>(stringify!($param))?),*).await,
                )
            },
        )
    }};
    (
        $(#[$meta:meta])*
        fn $name:ident ( $($param:ident : $ty:ty $(= $default:expr)?),* $(,)? ) -> $ret:ty $body:block
    ) => {{
        $(#[$meta])*
        fn $name($($param: $ty),*) -> $ret $body

        $crate::Computation::new(
            $crate::computation!(@def $name, fn $name($($param: $ty),*) -> $ret $body, $($param $(= $default)?),*),
            move |args: $crate::BoundArguments| {
                ::core::result::Result::<_, $crate::ComputationError>::Ok(
                    $name($(args.get::<$ty>(stringify!($param))?),*),
                )
            },
        )
    }};
    (@def $name:ident, $source:item, $($param:ident $(= $default:expr)?),*) => {
        $crate::FunctionDef::new(
            $crate::identity::symbol_path(module_path!(), stringify!($name)),
            file!(),
        )
        .with_source(stringify!($source))
        .with_signature(
            $crate::Signature::new()
                $(.param($crate::computation!(@param $param $(= $default)?)))*
        )
    };
    (@param $param:ident) => {
        $crate::Parameter::positional(stringify!($param))
    };
    (@param $param:ident = $default:expr) => {
        $crate::Parameter::positional(stringify!($param)).with_default($default)
    };
}
