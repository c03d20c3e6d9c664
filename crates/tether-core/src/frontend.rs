//! Script front-end seam
//!
//! Parsing and running source text is not part of the bridge. A front end
//! plugs in through [`ScriptFrontEnd`] and drives bound objects through the
//! same facade operations host code uses (`get_property`, `call_method`,
//! `construct`, ...).

use tether_sdk::ScriptError;

use crate::engine::Engine;
use crate::handle::Handle;

/// Executes script source against an engine
pub trait ScriptFrontEnd: Send + Sync {
    /// Run `source`; `origin` names it in error messages. The returned
    /// handle owns its reference.
    fn execute(&self, engine: &Engine, source: &str, origin: &str) -> Result<Handle, ScriptError>;
}
