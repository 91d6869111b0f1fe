//! Horizon core types shared by the store, the substrates and the CLI.
//!
//! - [`ObjectKey`] / [`Scope`]: identity and the key codec
//! - [`Object`] / [`ObjectMeta`]: decoded objects
//! - [`HzError`] / [`Status`]: the error surface every store operation returns
//! - [`sanitize`]: the read-only field set and its stripping

#![forbid(unsafe_code)]

mod error;
mod key;
mod object;
pub mod sanitize;

pub use error::{HzError, HzResult, Status};
pub use key::{InvalidKey, ObjectKey, Scope, KEY_SEPARATOR, NAMESPACE_ROOT};
pub use object::{Object, ObjectMeta};

pub mod prelude {
    pub use super::{HzError, HzResult, Object, ObjectKey, ObjectMeta, Scope, Status, NAMESPACE_ROOT};
}
