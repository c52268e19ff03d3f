//! Unified error handling with Sentry integration.
//!
//! Provides a unified `Error` type for the user-initiated paths (login,
//! explicit resync, startup). Background sync never returns errors; it logs
//! them and leaves a breadcrumb via [`add_breadcrumb`].

use thiserror::Error;

use crate::api::ApiError;
use crate::config::ConfigError;
use crate::session::SessionError;
use crate::storage::StorageError;

/// Engine-level error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration could not be loaded.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Durable storage operation failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Remote cart API call failed.
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    /// Login or logout failed.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// The operation needs an authenticated session.
    #[error("Not logged in")]
    NotLoggedIn,

    /// The cart is locked after checkout.
    #[error("Cart is locked")]
    Locked,
}

impl Error {
    /// Report the error to Sentry if it is one we cannot blame on the user,
    /// and log it.
    pub fn capture(&self) {
        if matches!(self, Self::Storage(_) | Self::Api(_) | Self::Session(_)) {
            let event_id = sentry::capture_error(self);
            tracing::error!(
                error = %self,
                sentry_event_id = %event_id,
                "Cart operation failed"
            );
        } else {
            tracing::warn!(error = %self, "Cart operation rejected");
        }
    }
}

/// Result type alias for `Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Set the Sentry user context from a user ID.
///
/// Call this after successful authentication to associate errors with users.
pub fn set_sentry_user(user_id: &impl ToString) {
    sentry::configure_scope(|scope| {
        scope.set_user(Some(sentry::User {
            id: Some(user_id.to_string()),
            ..Default::default()
        }));
    });
}

/// Clear the Sentry user context.
///
/// Call this on logout to stop associating errors with the user.
pub fn clear_sentry_user() {
    sentry::configure_scope(|scope| {
        scope.set_user(None);
    });
}

/// Add a breadcrumb for cart activity.
///
/// Breadcrumbs appear in Sentry error reports to show the trail of cart
/// activity leading up to an error.
///
/// # Example
///
/// ```rust,ignore
/// add_breadcrumb("cart.sync", "Partial sync failed", Some(&[("retry", "2")]));
/// ```
pub fn add_breadcrumb(category: &str, message: &str, data: Option<&[(&str, &str)]>) {
    let mut breadcrumb = sentry::Breadcrumb {
        category: Some(category.to_string()),
        message: Some(message.to_string()),
        level: sentry::Level::Info,
        ..Default::default()
    };

    if let Some(pairs) = data {
        for (key, value) in pairs {
            breadcrumb.data.insert(
                (*key).to_string(),
                serde_json::Value::String((*value).to_string()),
            );
        }
    }

    sentry::add_breadcrumb(breadcrumb);
}
