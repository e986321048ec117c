//! Plugin handles: the caller-facing invocation API.

use std::sync::{Arc, Weak};

use plinth_core::{ExecutionState, PlinthError, PluginId, Result};
use plinth_plugin::{CallOptions, PluginInstance};
use tokio::sync::oneshot;
use tracing::debug;

use crate::context::Shared;

/// Handle to a plugin owned by a [`Context`](crate::Context).
///
/// Dropping the handle frees the plugin.
pub struct Plugin {
    id: PluginId,
    shared: Weak<Shared>,
}

impl Plugin {
    pub(crate) fn new(id: PluginId, shared: Weak<Shared>) -> Self {
        Self { id, shared }
    }

    /// Identifier of the plugin, stable across updates.
    pub fn id(&self) -> PluginId {
        self.id
    }

    fn instance(&self) -> Result<Arc<PluginInstance>> {
        self.shared
            .upgrade()
            .ok_or(PlinthError::UseAfterFree(self.id))?
            .resolve(self.id)
    }

    /// Calls an export, blocking the current thread until it returns.
    pub fn call(&self, function: &str, input: impl AsRef<[u8]>) -> Result<Vec<u8>> {
        self.call_with(function, input, &CallOptions::default())
    }

    /// Calls an export with per-call cancellation token and timeout.
    pub fn call_with(
        &self,
        function: &str,
        input: impl AsRef<[u8]>,
        options: &CallOptions,
    ) -> Result<Vec<u8>> {
        self.instance()?.call(function, input.as_ref(), options)
    }

    /// Calls an export without blocking the executor.
    ///
    /// The guest runs on a dedicated thread. Dropping the returned future
    /// cancels the call.
    pub async fn call_async(
        &self,
        function: &str,
        input: impl Into<Vec<u8>>,
        options: CallOptions,
    ) -> Result<Vec<u8>> {
        let instance = self.instance()?;
        let token = options.token().cloned().unwrap_or_default();
        let options = options.with_token(token.clone());
        if token.is_cancelled() {
            return instance.call(function, &[], &options);
        }

        let (tx, rx) = oneshot::channel();
        let function = function.to_string();
        let input = input.into();
        let guard = token.drop_guard();
        std::thread::Builder::new()
            .name(format!("plinth-call-{}", self.id.get()))
            .spawn(move || {
                let result = instance.call(&function, &input, &options);
                if tx.send(result).is_err() {
                    debug!(plugin = %instance.id(), function, "call result dropped");
                }
            })?;

        let result = rx
            .await
            .map_err(|_| PlinthError::Trap("call worker exited without a result".to_string()))?;
        guard.disarm();
        result
    }

    /// Requests cancellation of the running call. Returns false when
    /// nothing is running.
    pub fn cancel(&self) -> Result<bool> {
        Ok(self.instance()?.request_cancel())
    }

    /// Returns false when the export is missing or the plugin is gone.
    pub fn function_exists(&self, name: &str) -> bool {
        self.instance()
            .map(|instance| instance.function_exists(name))
            .unwrap_or(false)
    }

    /// Names of the plugin's exported functions.
    pub fn functions(&self) -> Result<Vec<String>> {
        Ok(self.instance()?.functions())
    }

    /// Merges a JSON object of string values into the plugin configuration.
    pub fn update_config(&self, json: impl AsRef<[u8]>) -> Result<()> {
        self.instance()?.update_config(json.as_ref())
    }

    /// Current execution state.
    pub fn state(&self) -> Result<ExecutionState> {
        Ok(self.instance()?.state())
    }

    /// Message of the last failed operation. `None` after a success or
    /// once the plugin is gone.
    pub fn last_error(&self) -> Option<String> {
        self.instance().ok()?.last_error()
    }

    /// Output of the most recent successful call.
    pub fn output(&self) -> Result<Vec<u8>> {
        Ok(self.instance()?.output())
    }

    /// Frees the plugin now rather than when the handle drops.
    pub fn free(self) {
        drop(self);
    }
}

impl Drop for Plugin {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.remove(self.id);
        }
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin").field("id", &self.id).finish()
    }
}
