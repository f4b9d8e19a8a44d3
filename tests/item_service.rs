mod common;

use branch_queue::model::Row;
use branch_queue::services::{ItemService, SqlItemService};
use common::ScriptedConnection;

#[tokio::test]
async fn test_entity_prefix_gets_trailing_underscore() {
    let connection = ScriptedConnection::new("shop", "db:3306");
    connection.on(
        "FROM wiser_entity",
        vec![Row::new().with("dedicated_table_prefix", "product")],
    );
    let items = SqlItemService::new(connection.clone());

    assert_eq!(items.get_table_prefix_for_entity("product").await.unwrap(), "product_");
    assert_eq!(items.get_table_prefix_for_entity("").await.unwrap(), "");
    assert_eq!(connection.queries.lock().len(), 1);
}

#[tokio::test]
async fn test_entity_without_dedicated_tables_has_no_prefix() {
    let connection = ScriptedConnection::new("shop", "db:3306");
    let items = SqlItemService::new(connection);

    assert_eq!(items.get_table_prefix_for_entity("category").await.unwrap(), "");
}

#[tokio::test]
async fn test_delete_moves_item_and_details_to_archive() {
    let connection = ScriptedConnection::new("shop", "db:3306");
    connection.on(
        "FROM wiser_entity",
        vec![Row::new().with("dedicated_table_prefix", "product_")],
    );
    let items = SqlItemService::new(connection.clone());

    items.delete(6, "product", false).await.unwrap();

    let executed = connection.executed.lock().clone();
    assert_eq!(
        executed,
        vec![
            "INSERT INTO `product_wiser_item_archive` SELECT * FROM `product_wiser_item` WHERE `id` = ?",
            "DELETE FROM `product_wiser_item` WHERE `id` = ?",
            "INSERT INTO `product_wiser_itemdetail_archive` SELECT * FROM `product_wiser_itemdetail` WHERE `item_id` = ?",
            "DELETE FROM `product_wiser_itemdetail` WHERE `item_id` = ?",
        ]
    );
}

#[tokio::test]
async fn test_undelete_restores_from_archive() {
    let connection = ScriptedConnection::new("shop", "db:3306");
    let items = SqlItemService::new(connection.clone());

    items.delete(6, "product", true).await.unwrap();

    let moves = connection.executed_matching("INSERT INTO");
    assert_eq!(
        moves[0],
        "INSERT INTO `wiser_item` SELECT * FROM `wiser_item_archive` WHERE `id` = ?"
    );
}

#[tokio::test]
async fn test_delete_of_missing_item_is_not_found() {
    let connection = ScriptedConnection::new("shop", "db:3306");
    connection.affect("INSERT INTO `wiser_item_archive`", 0);
    let items = SqlItemService::new(connection.clone());

    let error = items.delete(42, "product", false).await.unwrap_err();
    assert_eq!(error.to_string(), "Item #42 not found");
    assert!(connection.executed_matching("wiser_itemdetail").is_empty());
}

#[tokio::test]
async fn test_link_type_settings_and_prefixes() {
    let connection = ScriptedConnection::new("shop", "db:3306");
    connection.on(
        "ORDER BY id",
        vec![Row::new()
            .with("id", 3u64)
            .with("type", 1i64)
            .with("name", "category")
            .with("destination_entity_type", "category")
            .with("connected_entity_type", "product")
            .with("use_dedicated_table", 1i64)],
    );
    connection.on(
        "SELECT use_dedicated_table FROM wiser_link",
        vec![Row::new().with("use_dedicated_table", 1i64)],
    );
    let items = SqlItemService::new(connection);

    let settings = items.get_all_link_type_settings().await.unwrap();
    assert_eq!(settings.len(), 1);
    assert_eq!(settings[0].link_type, 1);
    assert_eq!(settings[0].source_entity_type, "product");
    assert!(settings[0].use_dedicated_table);

    assert_eq!(items.get_table_prefix_for_link(1, "product").await.unwrap(), "1_");
}

#[tokio::test]
async fn test_long_value_wins_over_value() {
    let connection = ScriptedConnection::new("shop", "db:3306");
    connection.on(
        "FROM `wiser_itemdetail`",
        vec![
            Row::new().with("key", "title").with("value", "Bike").with("long_value", ""),
            Row::new()
                .with("key", "body")
                .with("value", "")
                .with("long_value", "A long description"),
        ],
    );
    let items = SqlItemService::new(connection);

    let details = items.get_item_details("", 6).await.unwrap();
    assert_eq!(details.len(), 2);
    assert_eq!(details[0].value, "Bike");
    assert_eq!(details[1].value, "A long description");
    assert_eq!(details[1].owner_id, 6);
}
