//! Explicit signature descriptors and call binding.
//!
//! A [`Signature`] is declared once when a computation is defined and is
//! reused for every call. Binding maps a [`CallArgs`] (positional values plus
//! keyword values) onto the declared parameters, applies defaults, and yields
//! [`BoundArguments`] in declaration order, so the same logical call always
//! binds identically no matter how its arguments were spelled.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{CacheError, CacheResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ParamKind {
    PositionalOnly,
    PositionalOrKeyword,
    /// Absorbs every unmatched positional argument into an array.
    VarPositional,
    KeywordOnly,
    /// Absorbs every unmatched keyword argument into a sorted object.
    VarKeyword,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    name: String,
    kind: ParamKind,
    default: Option<Value>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
        }
    }

    pub fn positional_only(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::PositionalOnly)
    }

    pub fn positional(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::PositionalOrKeyword)
    }

    pub fn var_positional(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::VarPositional)
    }

    pub fn keyword_only(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::KeywordOnly)
    }

    pub fn var_keyword(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::VarKeyword)
    }

    #[must_use]
    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ParamKind {
        self.kind
    }

    pub fn default(&self) -> Option<&Value> {
        self.default.as_ref()
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ParamKind::VarPositional => write!(f, "*{}", self.name),
            ParamKind::VarKeyword => write!(f, "**{}", self.name),
            _ => match &self.default {
                Some(default) => write!(f, "{}={default}", self.name),
                None => f.write_str(&self.name),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Signature {
    params: Vec<Parameter>,
}

impl Signature {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn param(mut self, param: Parameter) -> Self {
        self.params.push(param);
        self
    }

    pub fn params(&self) -> &[Parameter] {
        &self.params
    }

    pub fn contains(&self, name: &str) -> bool {
        self.params.iter().any(|param| param.name == name)
    }

    /// Rejects descriptors no call could bind against.
    pub fn validate(&self) -> CacheResult<()> {
        let invalid = |reason: String| Err(CacheError::InvalidSignature { reason });
        let mut seen = HashSet::new();
        let mut previous = ParamKind::PositionalOnly;
        let mut defaulted_positional = false;

        for param in &self.params {
            if !seen.insert(param.name.as_str()) {
                return invalid(format!("duplicate parameter `{}`", param.name));
            }
            if param.kind < previous {
                return invalid(format!(
                    "parameter `{}` ({:?}) follows a {:?} parameter",
                    param.name, param.kind, previous
                ));
            }
            if param.kind == previous
                && matches!(param.kind, ParamKind::VarPositional | ParamKind::VarKeyword)
            {
                return invalid(format!("more than one {:?} parameter", param.kind));
            }
            if param.default.is_some()
                && matches!(param.kind, ParamKind::VarPositional | ParamKind::VarKeyword)
            {
                return invalid(format!("variadic parameter `{}` has a default", param.name));
            }
            if matches!(
                param.kind,
                ParamKind::PositionalOnly | ParamKind::PositionalOrKeyword
            ) {
                if param.default.is_some() {
                    defaulted_positional = true;
                } else if defaulted_positional {
                    return invalid(format!(
                        "required parameter `{}` follows a parameter with a default",
                        param.name
                    ));
                }
            }
            previous = param.kind;
        }
        Ok(())
    }

    /// Binds `args` against this signature on behalf of `function`.
    pub fn bind(&self, function: &str, args: &CallArgs) -> CacheResult<BoundArguments> {
        let fail = |reason: String| CacheError::InvalidArguments {
            function: function.to_string(),
            signature: self.to_string(),
            given: args.to_string(),
            reason,
        };

        let mut keywords: BTreeMap<&str, &Value> = args
            .keyword
            .iter()
            .map(|(name, value)| (name.as_str(), value))
            .collect();
        let mut positional = args.positional.iter();
        let mut values = Vec::with_capacity(self.params.len());

        for param in &self.params {
            let value = match param.kind {
                ParamKind::PositionalOnly => positional
                    .next()
                    .cloned()
                    .or_else(|| param.default.clone()),
                ParamKind::PositionalOrKeyword => match positional.next() {
                    Some(value) => {
                        if keywords.contains_key(param.name.as_str()) {
                            return Err(fail(format!(
                                "multiple values for argument `{}`",
                                param.name
                            )));
                        }
                        Some(value.clone())
                    }
                    None => keywords
                        .remove(param.name.as_str())
                        .cloned()
                        .or_else(|| param.default.clone()),
                },
                ParamKind::VarPositional => {
                    Some(Value::Array(positional.by_ref().cloned().collect()))
                }
                ParamKind::KeywordOnly => keywords
                    .remove(param.name.as_str())
                    .cloned()
                    .or_else(|| param.default.clone()),
                ParamKind::VarKeyword => {
                    let rest: Map<String, Value> = keywords
                        .iter()
                        .map(|(name, value)| ((*name).to_string(), (*value).clone()))
                        .collect();
                    keywords.clear();
                    Some(Value::Object(rest))
                }
            };

            match value {
                Some(value) => values.push((param.name.clone(), value)),
                None => {
                    return Err(fail(format!(
                        "missing required argument `{}`",
                        param.name
                    )));
                }
            }
        }

        let extra = positional.count();
        if extra > 0 {
            let accepted = args.positional.len() - extra;
            return Err(fail(format!(
                "takes {accepted} positional argument(s) but {} were given",
                args.positional.len()
            )));
        }
        if let Some(name) = keywords.keys().next() {
            return Err(fail(format!("unexpected keyword argument `{name}`")));
        }

        Ok(BoundArguments { values })
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::with_capacity(self.params.len() + 2);
        let mut iter = self.params.iter().peekable();
        let mut keyword_marker_needed = true;

        while let Some(param) = iter.next() {
            if param.kind == ParamKind::VarPositional {
                keyword_marker_needed = false;
            }
            if param.kind == ParamKind::KeywordOnly && keyword_marker_needed {
                parts.push("*".to_string());
                keyword_marker_needed = false;
            }
            parts.push(param.to_string());
            if param.kind == ParamKind::PositionalOnly
                && iter
                    .peek()
                    .is_none_or(|next| next.kind != ParamKind::PositionalOnly)
            {
                parts.push("/".to_string());
            }
        }
        write!(f, "({})", parts.join(", "))
    }
}

/// Arguments of one call, as the caller spelled them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    positional: Vec<Value>,
    keyword: BTreeMap<String, Value>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    #[must_use]
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keyword.insert(name.into(), value.into());
        self
    }

    /// Adds a positional argument of any serializable type.
    pub fn try_arg(mut self, value: &impl Serialize) -> CacheResult<Self> {
        self.positional
            .push(serde_json::to_value(value).map_err(CacheError::serialization)?);
        Ok(self)
    }

    /// Adds a keyword argument of any serializable type.
    pub fn try_kwarg(mut self, name: impl Into<String>, value: &impl Serialize) -> CacheResult<Self> {
        self.keyword.insert(
            name.into(),
            serde_json::to_value(value).map_err(CacheError::serialization)?,
        );
        Ok(self)
    }

    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    pub fn keyword(&self) -> &BTreeMap<String, Value> {
        &self.keyword
    }
}

impl fmt::Display for CallArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let positional: Vec<String> = self.positional.iter().map(Value::to_string).collect();
        let keyword: Vec<String> = self
            .keyword
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        write!(
            f,
            "args=[{}] kwargs={{{}}}",
            positional.join(", "),
            keyword.join(", ")
        )
    }
}

/// Builds [`CallArgs`]: positional values, then `;` and `name = value` pairs.
///
/// ```
/// let args = cachestore::call_args![1, 2; scale = 3];
/// assert_eq!(args.positional().len(), 2);
/// ```
#[macro_export]
macro_rules! call_args {
    () => {
        $crate::CallArgs::new()
    };
    ($($value:expr),* $(,)? $(; $($name:ident = $kw:expr),* $(,)?)?) => {
        $crate::CallArgs::new()
            $(.arg($value))*
            $($(.kwarg(stringify!($name), $kw))*)?
    };
}

/// Arguments after binding, in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoundArguments {
    values: Vec<(String, Value)>,
}

impl BoundArguments {
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(param, _)| param == name)
            .map(|(_, value)| value)
    }

    /// Decodes the bound value of `name`.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> CacheResult<T> {
        let value = self
            .value(name)
            .ok_or_else(|| CacheError::UnknownParameter {
                name: name.to_string(),
            })?;
        T::deserialize(value).map_err(|source| CacheError::Decode {
            name: name.to_string(),
            source,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values
            .iter()
            .map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
