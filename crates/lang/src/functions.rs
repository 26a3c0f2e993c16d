//! Function registry
//!
//! Built-in functions registered by the host and the runtime's own `std`
//! namespace go through one table; user-defined `fn` definitions are
//! dispatched by the evaluator with the same calling convention.

use std::collections::HashMap;
use std::sync::Arc;

use crate::console::LogConsole;
use crate::error::Error;
use crate::value::Literal;

/// Arity contract of a registered function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamCount {
    Exact(usize),
    AtLeast(usize),
    Between(usize, usize),
}

impl ParamCount {
    pub fn accepts(self, count: usize) -> bool {
        match self {
            ParamCount::Exact(n) => count == n,
            ParamCount::AtLeast(n) => count >= n,
            ParamCount::Between(low, high) => (low..=high).contains(&count),
        }
    }
}

impl std::fmt::Display for ParamCount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamCount::Exact(n) => write!(f, "exactly {n}"),
            ParamCount::AtLeast(n) => write!(f, "at least {n}"),
            ParamCount::Between(low, high) => write!(f, "between {low} and {high}"),
        }
    }
}

/// What a built-in callback may touch during a call.
pub struct EvalContext<'a> {
    pub console: &'a mut LogConsole,
    pub env: &'a HashMap<String, Literal>,
    /// Read cursor at the moment of the call.
    pub offset: u64,
    /// Line of the call site, for error payloads.
    pub line: u32,
}

impl EvalContext<'_> {
    /// Abort evaluation from inside a builtin.
    pub fn abort(&self, message: impl Into<String>) -> Error {
        Error::Evaluation {
            line: self.line,
            message: message.into(),
        }
    }
}

pub type FunctionCallback =
    Arc<dyn Fn(&mut EvalContext<'_>, &[Literal]) -> Result<Option<Literal>, Error> + Send + Sync>;

#[derive(Clone)]
pub struct PatternFunction {
    pub param_count: ParamCount,
    pub callback: FunctionCallback,
}

/// Functions registered under `namespace::name`.
#[derive(Default, Clone)]
pub struct FunctionRegistry {
    functions: HashMap<String, PatternFunction>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        namespace: &str,
        name: &str,
        param_count: ParamCount,
        callback: impl Fn(&mut EvalContext<'_>, &[Literal]) -> Result<Option<Literal>, Error>
            + Send
            + Sync
            + 'static,
    ) {
        let qualified = if namespace.is_empty() {
            name.to_string()
        } else {
            format!("{namespace}::{name}")
        };
        self.functions.insert(
            qualified,
            PatternFunction {
                param_count,
                callback: Arc::new(callback),
            },
        );
    }

    pub fn get(&self, qualified_name: &str) -> Option<&PatternFunction> {
        self.functions.get(qualified_name)
    }

    pub fn contains(&self, qualified_name: &str) -> bool {
        self.functions.contains_key(qualified_name)
    }
}

/// Register the `std` builtins every runtime carries.
pub fn register_std(registry: &mut FunctionRegistry) {
    registry.register("std", "print", ParamCount::AtLeast(1), |ctx, args| {
        let message = args
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        ctx.console.info(message);
        Ok(None)
    });

    registry.register("std", "warn", ParamCount::Exact(1), |ctx, args| {
        ctx.console.warning(args[0].to_string());
        Ok(None)
    });

    registry.register("std", "error", ParamCount::Exact(1), |ctx, args| {
        ctx.console.error(args[0].to_string());
        Err(ctx.abort(args[0].to_string()))
    });

    registry.register("std", "assert", ParamCount::Exact(2), |ctx, args| {
        if !args[0].to_bool() {
            return Err(ctx.abort(format!("assertion failed \"{}\"", args[1])));
        }
        Ok(None)
    });

    registry.register("std", "env", ParamCount::Exact(1), |ctx, args| {
        let name = args[0].to_string();
        match ctx.env.get(&name) {
            Some(value) => Ok(Some(value.clone())),
            None => Err(ctx.abort(format!("no environment variable named \"{name}\""))),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_count_contracts() {
        assert!(ParamCount::Exact(2).accepts(2));
        assert!(!ParamCount::Exact(2).accepts(3));
        assert!(ParamCount::AtLeast(1).accepts(5));
        assert!(!ParamCount::AtLeast(1).accepts(0));
        assert!(ParamCount::Between(1, 3).accepts(3));
        assert!(!ParamCount::Between(1, 3).accepts(4));
    }

    fn context<'a>(
        console: &'a mut LogConsole,
        env: &'a HashMap<String, Literal>,
    ) -> EvalContext<'a> {
        EvalContext {
            console,
            env,
            offset: 0,
            line: 1,
        }
    }

    #[test]
    fn test_std_print_logs_to_console() {
        let mut registry = FunctionRegistry::new();
        register_std(&mut registry);

        let mut console = LogConsole::new();
        let env = HashMap::new();
        let function = registry.get("std::print").unwrap().clone();
        (function.callback)(
            &mut context(&mut console, &env),
            &[Literal::Str("value:".into()), Literal::Unsigned(16)],
        )
        .unwrap();

        assert_eq!(console.entries()[0].1, "[i] value: 16");
    }

    #[test]
    fn test_std_assert_aborts_on_false() {
        let mut registry = FunctionRegistry::new();
        register_std(&mut registry);

        let mut console = LogConsole::new();
        let env = HashMap::new();
        let function = registry.get("std::assert").unwrap().clone();

        let ok = (function.callback)(
            &mut context(&mut console, &env),
            &[Literal::Bool(true), Literal::Str("fine".into())],
        );
        assert!(ok.is_ok());

        let err = (function.callback)(
            &mut context(&mut console, &env),
            &[Literal::Bool(false), Literal::Str("broken".into())],
        );
        assert!(matches!(err, Err(Error::Evaluation { .. })));
    }

    #[test]
    fn test_std_env_reads_host_variables() {
        let mut registry = FunctionRegistry::new();
        register_std(&mut registry);

        let mut console = LogConsole::new();
        let mut env = HashMap::new();
        env.insert("limit".to_string(), Literal::Unsigned(42));
        let function = registry.get("std::env").unwrap().clone();

        let value = (function.callback)(
            &mut context(&mut console, &env),
            &[Literal::Str("limit".into())],
        )
        .unwrap();
        assert_eq!(value, Some(Literal::Unsigned(42)));
    }
}
