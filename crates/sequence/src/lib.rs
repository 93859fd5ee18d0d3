//! Sequence definitions: versioned, immutable step DAGs.
//!
//! A sequence is config-as-data: a named, versioned list of steps whose
//! `depends_on` edges form a DAG. Validation is a pure function so it can be
//! tested without any store; the registry validates at publish time and
//! never mutates a published version.

pub mod dag;
pub mod definition;
pub mod registry;

pub use dag::{DagError, execution_layers, topo_order, validate_dag};
pub use definition::{
    BackoffStrategy, ChainRule, ChainWhen, Criticality, RetryPolicy, SequenceDefinition,
    StepDefinition,
};
pub use registry::{InMemorySequenceRegistry, RegistryError, SequenceRegistry};
