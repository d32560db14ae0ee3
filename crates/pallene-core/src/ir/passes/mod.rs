//! Analysis and optimization passes over the IR
//!
//! The driver selects passes by name: `"uninitialized"` runs the
//! uninitialized-variable check, `"constant_propagation"` folds and
//! propagates literal-valued locals. Both run by default.

pub mod constprop;
pub mod uninit;

pub use uninit::UninitError;

use std::collections::BTreeSet;
use std::str::FromStr;

use thiserror::Error;

use super::Module;

/// A selectable pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Pass {
    /// Reject reads of locals that may be uninitialized
    Uninitialized,
    /// Fold and propagate compile-time constants
    ConstantPropagation,
}

/// An unrecognized pass name
#[derive(Error, Debug, Clone, PartialEq)]
#[error("unknown pass '{0}'")]
pub struct UnknownPass(pub String);

impl FromStr for Pass {
    type Err = UnknownPass;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uninitialized" => Ok(Pass::Uninitialized),
            "constant_propagation" => Ok(Pass::ConstantPropagation),
            other => Err(UnknownPass(other.to_string())),
        }
    }
}

/// Which passes to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassConfig {
    passes: BTreeSet<Pass>,
}

impl Default for PassConfig {
    fn default() -> Self {
        Self::all()
    }
}

impl PassConfig {
    /// Every pass
    #[must_use]
    pub fn all() -> Self {
        Self {
            passes: BTreeSet::from([Pass::Uninitialized, Pass::ConstantPropagation]),
        }
    }

    /// No passes
    #[must_use]
    pub fn none() -> Self {
        Self {
            passes: BTreeSet::new(),
        }
    }

    /// Build a configuration from pass names
    ///
    /// # Errors
    ///
    /// Returns the first unrecognized name.
    pub fn from_names<'n>(names: impl IntoIterator<Item = &'n str>) -> Result<Self, UnknownPass> {
        let mut passes = BTreeSet::new();
        for name in names {
            passes.insert(name.parse::<Pass>()?);
        }
        Ok(Self { passes })
    }

    /// Enable one more pass
    #[must_use]
    pub fn with(mut self, pass: Pass) -> Self {
        self.passes.insert(pass);
        self
    }

    /// Is the pass enabled?
    #[must_use]
    pub fn enabled(&self, pass: Pass) -> bool {
        self.passes.contains(&pass)
    }
}

/// Run the configured passes over a module, in pipeline order
///
/// # Errors
///
/// Returns the first error the uninitialized-variable check produces.
pub fn run_passes(module: &mut Module, config: &PassConfig) -> Result<(), UninitError> {
    if config.enabled(Pass::Uninitialized) {
        uninit::check_module(module)?;
    }
    if config.enabled(Pass::ConstantPropagation) {
        constprop::run(module);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_names_round_trip() {
        assert_eq!("uninitialized".parse(), Ok(Pass::Uninitialized));
        assert_eq!(
            "constant_propagation".parse(),
            Ok(Pass::ConstantPropagation)
        );
        assert!("dead_code".parse::<Pass>().is_err());
    }

    #[test]
    fn config_from_names() {
        let config = PassConfig::from_names(["uninitialized"]).unwrap();
        assert!(config.enabled(Pass::Uninitialized));
        assert!(!config.enabled(Pass::ConstantPropagation));
    }
}
