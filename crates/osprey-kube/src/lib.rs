//! Minimal Kubernetes object machinery shared by the osprey storage backends.
//!
//! # Purpose
//! The storage layer works with typed Kubernetes objects but must stay
//! agnostic of any particular kind. This crate provides the pieces every
//! backend needs: resource identity ([`meta::ResourceInfo`]), a uniform
//! object trait ([`object::KubeObject`]) over `k8s-openapi` types and
//! dynamic objects, label/field selectors with pluggable attribute
//! extraction ([`selector`]), watch event types ([`watch`]), and the
//! categorized storage error ([`error::StorageError`]).

pub mod error;
pub mod meta;
pub mod object;
pub mod selector;
pub mod watch;

pub use error::{StorageError, StorageResult};
pub use meta::{GroupResource, RequestContext, ResourceInfo};
pub use object::{DynamicObject, KubeObject};
pub use selector::{Attributes, FieldSelector, LabelSelector, ListOptions, SelectionPredicate};
pub use watch::{Event, EventType};
