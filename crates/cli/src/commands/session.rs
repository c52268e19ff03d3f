//! Login, logout, and explicit resync.

use tracing::info;

use cart_sync_client::{AuthUser, CartClient, HttpCartApi};
use cart_sync_core::{UserId, UserRole};

/// Log in as `user_id`, merging the guest cart.
///
/// # Errors
///
/// Returns an error if the user ID or role is invalid, or the login sequence
/// fails (the session then stays logged out).
pub async fn login(
    client: &CartClient<HttpCartApi>,
    user_id: &str,
    token: String,
    role: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let user_id = UserId::parse(user_id)?;
    let role: UserRole = role.parse()?;
    let guest_items = client.store().items().len();

    client
        .login(AuthUser::new(user_id.clone(), role, token))
        .await?;

    info!(
        %user_id,
        %role,
        merged = guest_items,
        items = client.store().items().len(),
        "Logged in"
    );
    Ok(())
}

/// Log out and reset to an empty guest cart.
pub fn logout(client: &CartClient<HttpCartApi>) {
    client.logout();
}

/// Send the whole cart as a full sync.
///
/// # Errors
///
/// Returns an error if not logged in, the cart is locked, or the request fails.
pub async fn resync(client: &CartClient<HttpCartApi>) -> Result<(), Box<dyn std::error::Error>> {
    client.force_full_sync().await.inspect_err(|e| e.capture())?;
    info!(items = client.store().items().len(), "Cart resynced");
    Ok(())
}
