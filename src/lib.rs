//! Linear regression with high-dimensional fixed effects and instrumental variables.
//!
//! This crate estimates models of the form
//!
//! ```text
//! y = X β + W γ + α_g + ... + ε,    W instrumented by Z
//! ```
//!
//! where the categorical effects `α_g` may have many thousands of levels and
//! are absorbed (demeaned away) rather than expanded into dummy columns. It
//! offers tools to
//!
//! - describe data and models (`data`, `formulation` and `fixed_effects` modules),
//! - select the estimation sample and drop singleton groups (`sample` module),
//! - absorb fixed effects through a pluggable solver (`solving` and `demean` modules),
//! - handle collinear columns and fit OLS or 2SLS (`basis` and `two_stage` modules),
//! - compute simple, robust and multi-way clustered covariances (`vcov` module), and
//! - test instrument strength with the Kleibergen–Paap rank test (`ranktest` module).
//!
//! Degrees of freedom account for the absorbed effects; a fixed effect nested
//! inside a cluster variable costs a single degree of freedom under clustering.
//!
//! # Quick start
//!
//! ```no_run
//! use hdfe::data::Table;
//! use hdfe::estimation::FixedEffectModel;
//! use hdfe::formulation::{FeTerm, Formulation};
//! use hdfe::options::EstimationOptions;
//! use hdfe::vcov::VcovMethod;
//!
//! let table = Table::builder()
//!     .numeric("wage", vec![10.0, 12.0, 11.5, 15.0, 9.0, 13.0])
//!     .numeric("hours", vec![38.0, 41.0, 40.0, 45.0, 35.0, 42.0])
//!     .categorical("firm", ["a", "a", "b", "b", "c", "c"])
//!     .categorical("year", ["1", "2", "1", "2", "1", "2"])
//!     .build()
//!     .expect("well-formed table");
//!
//! let formulation = Formulation::new("wage")
//!     .exogenous(["hours"])
//!     .fixed_effect(FeTerm::new("firm"))
//!     .fixed_effect(FeTerm::new("year"));
//!
//! let model = FixedEffectModel::new(formulation).expect("identified model");
//! let result = model
//!     .fit(&table, &VcovMethod::cluster(["firm"]), &EstimationOptions::default())
//!     .expect("estimation succeeds");
//! println!("hours: {:?} (se {:?})", result.coefficient("hours"), result.stderror());
//! ```

pub mod basis;
pub mod data;
pub mod demean;
pub mod error;
pub mod estimation;
pub mod fixed_effects;
pub mod formulation;
pub mod options;
pub mod ranktest;
pub mod result;
pub mod sample;
pub mod solving;
pub mod two_stage;
pub mod vcov;

pub use demean::AlternatingProjections;
pub use error::{HdfeError, Result};
pub use estimation::FixedEffectModel;
pub use options::{EstimationOptions, Save};
pub use result::FixedEffectModelResult;
pub use solving::{FixedEffectSolver, SolverOptions, SolverSummary};
pub use vcov::VcovMethod;
