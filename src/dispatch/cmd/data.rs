//! The data bundle handed to command handlers.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::data::{Store, UserAccess};
use crate::state::{Channel, State, User, UserModes};

use super::fragment::BoundArgs;

/// Everything a command handler gets besides the message itself: the
/// resolved caller, resolved targets, bound arguments, and handles to the
/// server's state and the store (absent when disabled).
pub struct CommandData {
    /// The caller as seen in state, when state is enabled and the caller
    /// is visible.
    pub user: Option<User>,
    /// The caller's access record, when the command required
    /// authorization.
    pub user_access: Option<UserAccess>,
    /// The caller's prefix modes on the message channel.
    pub user_channel_modes: Option<UserModes>,
    /// The channel the message was sent to, when public.
    pub channel: Option<Channel>,
    /// The channel bound to the `#` argument, when declared and tracked.
    pub target_channel: Option<Channel>,
    /// Users resolved for keyed (`*name` / `~name`) slots.
    pub target_users: HashMap<String, User>,
    /// Access records resolved for keyed slots.
    pub target_user_access: HashMap<String, UserAccess>,
    /// Users resolved for a variadic user slot, in argument order.
    /// Username-style tokens resolve to access only, leaving `None` here.
    pub target_var_users: Vec<Option<User>>,
    /// Access records resolved for a variadic user slot, in argument
    /// order.
    pub target_var_user_access: Vec<UserAccess>,
    /// Arguments bound by the schema walk.
    pub args: BoundArgs,
    /// The server's state, when enabled.
    pub state: Option<Arc<RwLock<State>>>,
    /// The record store, when enabled.
    pub store: Option<Arc<Store>>,
}

impl CommandData {
    pub(super) fn new(
        args: BoundArgs,
        state: Option<Arc<RwLock<State>>>,
        store: Option<Arc<Store>>,
    ) -> Self {
        CommandData {
            user: None,
            user_access: None,
            user_channel_modes: None,
            channel: None,
            target_channel: None,
            target_users: HashMap::new(),
            target_user_access: HashMap::new(),
            target_var_users: Vec::new(),
            target_var_user_access: Vec::new(),
            args,
            state,
            store,
        }
    }

    /// The plain text bound for an argument id.
    pub fn arg(&self, id: &str) -> Option<&str> {
        self.args.get(id)
    }

    /// An argument split on commas.
    pub fn split_arg(&self, id: &str) -> Vec<String> {
        self.args
            .get(id)
            .map(|v| v.split(',').map(str::to_owned).collect())
            .unwrap_or_default()
    }

    /// The channel list bound for a `#` argument id.
    pub fn channels(&self, id: &str) -> &[String] {
        self.args
            .channels
            .get(id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
