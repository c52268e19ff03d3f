//! Local cart commands.
//!
//! These only touch the local store. When logged in, the changes stay
//! pending (and persisted) until a `watch` session or `resync` sends them.

use tracing::info;

use cart_sync_client::{CartClient, HttpCartApi};
use cart_sync_core::{IdError, ProductId};

/// Log the cart, its pending changes and the session.
pub fn show(client: &CartClient<HttpCartApi>) {
    let state = client.store().snapshot();
    let user = client.session().current_user();

    match &user {
        Some(user) => info!(user_id = %user.user_id, role = %user.role, "Logged in"),
        None => info!("Guest session"),
    }
    if state.locked {
        info!("Cart is locked until the next session");
    }

    if state.items.is_empty() {
        info!("Cart is empty");
    }
    for (product, quantity) in state.items.iter() {
        info!(%product, quantity, "Item");
    }
    info!(
        products = state.items.len(),
        total = state.items.total_quantity(),
        "Cart"
    );

    for (product, quantity) in state.dirty_items.iter() {
        if quantity == 0 {
            info!(%product, "Pending removal");
        } else {
            info!(%product, quantity, "Pending change");
        }
    }
}

/// Add `qty` (may be negative) to a product.
///
/// # Errors
///
/// Returns `IdError` if the product ID is empty or too long.
pub fn add(client: &CartClient<HttpCartApi>, product: &str, qty: i64) -> Result<(), IdError> {
    let product = ProductId::parse(product)?;
    client.store().add_item(&product, qty);
    info!(
        %product,
        quantity = client.store().items().get(&product),
        "Updated"
    );
    report_pending(client);
    Ok(())
}

/// Remove a product.
///
/// # Errors
///
/// Returns `IdError` if the product ID is empty or too long.
pub fn remove(client: &CartClient<HttpCartApi>, product: &str) -> Result<(), IdError> {
    let product = ProductId::parse(product)?;
    client.store().remove_item(&product);
    info!(%product, "Removed");
    report_pending(client);
    Ok(())
}

/// Empty the cart.
pub fn clear(client: &CartClient<HttpCartApi>) {
    client.store().clear();
    info!("Cart cleared");
}

fn report_pending(client: &CartClient<HttpCartApi>) {
    if client.store().is_locked() {
        info!("Cart is locked; nothing changed");
        return;
    }
    if client.session().is_authenticated() {
        let pending = client.store().dirty_items().len();
        info!(pending, "Run `cart-sync watch` or `cart-sync resync` to send pending changes");
    }
}
