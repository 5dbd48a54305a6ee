//! Maps fetched orders onto stored rows and writes them idempotently.

use basket_core::{
    absolute_source_link, extract_product_id, Item, Order, SourceOrder, UserId,
};
use basket_storage::{OrderStore, OrderWrite, StoreError};
use rust_decimal::Decimal;

pub fn order_row(user_id: UserId, source: &SourceOrder) -> Order {
    Order {
        order_number: source.order_number.clone(),
        user_id,
        placed_date: source.placed_date,
        grand_total: source.grand_total,
        subscription_discount: source.subscription_discount,
        recipient_name: source.recipient.as_ref().and_then(|r| r.name.clone()),
    }
}

/// Items inherit the order-level subscribe-and-save flag. Missing quantities
/// become 1 and missing prices 0.
pub fn item_rows(source: &SourceOrder) -> Vec<Item> {
    let order_subscribed = source.subscription_discount.is_some();
    source
        .items
        .iter()
        .map(|item| Item {
            order_number: source.order_number.clone(),
            product_id: item.link.as_deref().and_then(extract_product_id),
            title: item.title.clone(),
            link: item
                .link
                .as_deref()
                .filter(|l| !l.is_empty())
                .map(absolute_source_link),
            thumbnail_url: item.image_link.clone(),
            quantity: item.quantity.filter(|q| *q > 0).unwrap_or(1),
            unit_price: item.price.unwrap_or(Decimal::ZERO),
            is_subscribe_and_save: order_subscribed || item.is_subscribe_and_save,
        })
        .collect()
}

pub async fn persist_order(
    store: &dyn OrderStore,
    user_id: UserId,
    source: &SourceOrder,
) -> Result<OrderWrite, StoreError> {
    let order = order_row(user_id, source);
    let items = item_rows(source);
    store.save_order(&order, &items).await
}
