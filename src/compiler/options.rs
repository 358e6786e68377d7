use std::str::FromStr;

use crate::runtime::interp::DEFAULT_MAX_CALL_DEPTH;

#[derive(Debug, Clone)]
pub struct CompilerOptions {
    /// When set, toplevel `eval-when` follows file-compilation rules:
    /// `:compile-toplevel` forms run in the host and `:load-toplevel` forms
    /// are emitted. Otherwise only `:execute` matters.
    pub compiling_file: bool,
    /// Log one warning per called-but-undefined function at the end of a unit.
    pub warn_undefined_functions: bool,
    /// Prefix of the identifiers that hold dumped literals.
    pub literal_prefix: String,
    /// Call nesting allowed in the compile-time host, for macro expanders
    /// and `eval-when` code.
    pub max_call_depth: usize,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl CompilerOptions {
    pub fn new() -> Self {
        CompilerOptions {
            compiling_file: false,
            warn_undefined_functions: true,
            literal_prefix: "l".to_string(),
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }

    pub fn set_compiling_file(&mut self, compiling_file: bool) {
        self.compiling_file = compiling_file;
    }

    pub fn set_warn_undefined_functions(&mut self, warn: bool) {
        self.warn_undefined_functions = warn;
    }

    pub fn set_literal_prefix(&mut self, prefix: &str) {
        self.literal_prefix = prefix.to_string();
    }

    pub fn set_max_call_depth(&mut self, depth: usize) {
        self.max_call_depth = depth;
    }

    /// Defaults, overridden by `LISPJS_WARN_UNDEFINED`,
    /// `LISPJS_COMPILING_FILE` and `LISPJS_MAX_CALL_DEPTH`.
    pub fn from_env() -> Result<Self, String> {
        let mut options = Self::new();

        if let Some(warn) = read_bool_from_env("LISPJS_WARN_UNDEFINED")? {
            options.set_warn_undefined_functions(warn);
        }

        if let Some(compiling_file) = read_bool_from_env("LISPJS_COMPILING_FILE")? {
            options.set_compiling_file(compiling_file);
        }

        if let Ok(depth) = std::env::var("LISPJS_MAX_CALL_DEPTH") {
            let depth = depth
                .parse::<usize>()
                .map_err(|e| format!("LISPJS_MAX_CALL_DEPTH: {}", e))?;
            options.set_max_call_depth(depth);
        }

        Ok(options)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Flag(bool);

impl FromStr for Flag {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.to_lowercase();
        let s: &str = &s;

        match s {
            "1" | "true" | "yes" | "on" => Ok(Flag(true)),
            "0" | "false" | "no" | "off" | "" => Ok(Flag(false)),
            _ => Err(format!("invalid boolean: {:?}", s)),
        }
    }
}

fn read_bool_from_env(var: &str) -> Result<Option<bool>, String> {
    match std::env::var(var) {
        Ok(value) => value
            .parse::<Flag>()
            .map(|Flag(b)| Some(b))
            .map_err(|e| format!("{}: {}", var, e)),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_parse() {
        assert_eq!("TRUE".parse::<Flag>(), Ok(Flag(true)));
        assert_eq!("off".parse::<Flag>(), Ok(Flag(false)));
        assert!("maybe".parse::<Flag>().is_err());
    }

    #[test]
    fn defaults() {
        let options = CompilerOptions::new();
        assert!(!options.compiling_file);
        assert!(options.warn_undefined_functions);
        assert_eq!(options.literal_prefix, "l");
        assert_eq!(options.max_call_depth, DEFAULT_MAX_CALL_DEPTH);
    }
}
