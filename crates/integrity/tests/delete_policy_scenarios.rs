//! Integration tests for delete-policy processing
//!
//! Builds the metamodel from a YAML schema, runs whole deletes against the
//! in-memory gateway and executes the resulting deferred statements.

use std::sync::{Arc, Once};

use elif_integrity::{
    DeletePolicyEngine, Entity, EntityId, EntityRef, GatewayCall, InMemoryGateway, IntegrityConfig,
    IntegrityError, MetaModel, ProcessContext,
};

const SHOP_SCHEMA: &str = r#"
entities:
  - name: Customer
    table: customers
    relations:
      - name: orders
        target_type: Order
        cardinality: many
        inverse: customer
        on_delete: cascade
      - name: billing_address
        target_type: Address
        cardinality: one
        owning_side: true
        column: billing_address_id
        on_delete: cascade
  - name: Order
    table: orders
    relations:
      - name: customer
        target_type: Customer
        cardinality: one
        owning_side: true
        column: customer_id
        inverse: orders
      - name: lines
        target_type: OrderLine
        cardinality: many
        inverse: order
        on_delete: cascade
      - name: coupons
        target_type: Coupon
        cardinality: many
        owning_side: true
        join_table:
          table: order_coupons
          owner_column: order_id
          target_column: coupon_id
        on_delete: unlink
  - name: OrderLine
    table: order_lines
    relations:
      - name: order
        target_type: Order
        cardinality: one
        owning_side: true
        column: order_id
        inverse: lines
      - name: product
        target_type: Product
        cardinality: one
        owning_side: true
        column: product_id
        on_delete_inverse: DENY
  - name: Product
    table: products
  - name: Coupon
    table: coupons
  - name: Address
    table: addresses
  - name: Shipment
    table: shipments
    soft_delete: true
    relations:
      - name: order
        target_type: Order
        cardinality: one
        owning_side: true
        column: order_id
        on_delete_inverse: CASCADE
"#;

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

struct Shop {
    engine: DeletePolicyEngine,
    gateway: InMemoryGateway,
}

impl Shop {
    fn new() -> Self {
        init_tracing();
        let model = Arc::new(MetaModel::from_yaml_str(SHOP_SCHEMA).unwrap());
        let gateway = InMemoryGateway::new(model.clone());
        let engine = DeletePolicyEngine::new(
            model,
            Arc::new(gateway.clone()),
            IntegrityConfig::default().with_log_statements(true),
        );
        Self { engine, gateway }
    }

    fn stored(&self, entity: Entity) -> EntityRef {
        let entity = entity.into_ref();
        self.gateway.insert(&entity);
        entity
    }
}

#[tokio::test]
async fn test_customer_delete_cascades_through_unloaded_orders() {
    let shop = Shop::new();
    let customer = shop.stored(Entity::new("Customer", 1));
    shop.gateway
        .link(&customer, "billing_address", &EntityId::Int(70))
        .unwrap();
    shop.stored(Entity::new("Address", 70));

    let order = shop.stored(Entity::new("Order", 10));
    shop.gateway.link(&order, "customer", &EntityId::Int(1)).unwrap();
    shop.gateway.link(&order, "coupons", &EntityId::Int(5)).unwrap();
    for id in [100, 101] {
        let line = shop.stored(Entity::new("OrderLine", id));
        shop.gateway.link(&line, "order", &EntityId::Int(10)).unwrap();
    }
    let shipment = shop.stored(Entity::new("Shipment", 900));
    shop.gateway.link(&shipment, "order", &EntityId::Int(10)).unwrap();

    let deferred = shop.engine.delete(&customer).await.unwrap();

    assert_eq!(
        shop.gateway.removed(),
        vec![
            ("Shipment".to_string(), Some(EntityId::Int(900))),
            ("OrderLine".to_string(), Some(EntityId::Int(100))),
            ("OrderLine".to_string(), Some(EntityId::Int(101))),
            ("Order".to_string(), Some(EntityId::Int(10))),
            ("Customer".to_string(), Some(EntityId::Int(1))),
        ]
    );
    assert!(shipment.read().is_soft_deleted());

    let sql: Vec<&str> = deferred.statements().iter().map(|s| s.sql.as_str()).collect();
    assert_eq!(
        sql,
        vec![
            "DELETE FROM \"order_coupons\" WHERE \"order_id\" = $1",
            "UPDATE \"customers\" SET \"billing_address_id\" = NULL WHERE \"id\" = $1",
            "DELETE FROM \"addresses\" WHERE \"id\" = $1",
        ]
    );

    assert!(shop.gateway.contains("Address", &EntityId::Int(70)));
    let affected = deferred.run(&shop.gateway).await.unwrap();
    // The customer and order rows are already gone from the store, only the address row is left.
    assert_eq!(affected, 1);
    assert_eq!(shop.gateway.executed().len(), 3);
    assert_eq!(shop.gateway.executed()[2].params, vec![EntityId::Int(70)]);
    assert!(!shop.gateway.contains("Address", &EntityId::Int(70)));
    assert!(shop.gateway.links_of("Order", "coupons", &EntityId::Int(10)).is_empty());
}

#[tokio::test]
async fn test_product_in_use_blocks_delete_without_mutation() {
    let shop = Shop::new();
    let product = shop.stored(Entity::new("Product", 3));
    let line = shop.stored(Entity::new("OrderLine", 100));
    shop.gateway.link(&line, "product", &EntityId::Int(3)).unwrap();

    let err = shop.engine.delete(&product).await.unwrap_err();

    assert!(err.is_policy_violation());
    assert_eq!(
        err.to_string(),
        "Unable to delete 'Product': it is referenced by 'OrderLine' with a DENY delete policy"
    );
    assert!(shop.gateway.removed().is_empty());
    assert!(shop.gateway.contains("Product", &EntityId::Int(3)));
    assert!(!shop.gateway.calls().iter().any(|call| matches!(call, GatewayCall::ExecuteUpdate { .. })));
}

#[tokio::test]
async fn test_blocked_delete_does_not_block_unrelated_delete() {
    let shop = Shop::new();
    let order = shop.stored(Entity::new("Order", 10));
    let line = shop.stored(Entity::new("OrderLine", 100));
    shop.gateway.link(&line, "order", &EntityId::Int(10)).unwrap();
    let product = shop.stored(Entity::new("Product", 3));
    shop.gateway.link(&line, "product", &EntityId::Int(3)).unwrap();

    assert!(shop.engine.delete(&product).await.is_err());
    shop.gateway.clear_calls();

    let deferred = shop.engine.delete(&order).await.unwrap();
    assert_eq!(deferred.len(), 1);
    assert_eq!(
        shop.gateway.removed(),
        vec![
            ("OrderLine".to_string(), Some(EntityId::Int(100))),
            ("Order".to_string(), Some(EntityId::Int(10))),
        ]
    );
}

#[tokio::test]
async fn test_loaded_graph_is_fixed_up_in_memory() {
    let shop = Shop::new();
    let coupon = shop.stored(Entity::new("Coupon", 5));
    let customer = shop.stored(Entity::new("Customer", 1).with_one("billing_address", None));
    let order = Entity::new("Order", 10)
        .with_one("customer", Some(customer.clone()))
        .with_many("coupons", vec![coupon.clone()])
        .into_ref();
    let line = Entity::new("OrderLine", 100)
        .with_one("order", Some(order.clone()))
        .into_ref();
    order.write().set_many("lines", vec![line.clone()]);
    customer.write().set_many("orders", vec![order.clone()]);
    shop.gateway.insert_all([&order, &line]);

    let deferred = shop.engine.delete(&customer).await.unwrap();

    assert!(order.references("coupons").is_empty());
    assert!(order.read().is_removed());
    assert!(line.read().is_removed());
    assert!(!coupon.read().is_removed());
    // Only the shipment lookup reaches the store.
    assert_eq!(shop.gateway.query_count(), 1);
    assert!(deferred.is_empty());
}

#[tokio::test]
async fn test_shared_unit_of_work_deletes_each_row_once() {
    let shop = Shop::new();
    let order = shop.stored(Entity::new("Order", 10));
    let line = shop.stored(Entity::new("OrderLine", 100));
    shop.gateway.link(&line, "order", &EntityId::Int(10)).unwrap();

    let mut ctx = ProcessContext::new();
    order.write().mark_removed();
    shop.engine.process_in(&order, &mut ctx).await.unwrap();
    line.write().mark_removed();
    shop.engine.process_in(&line, &mut ctx).await.unwrap();

    assert_eq!(
        shop.gateway.removed(),
        vec![("OrderLine".to_string(), Some(EntityId::Int(100)))]
    );
    assert!(ctx.visited().contains(&line));
    assert_eq!(ctx.into_deferred().len(), 1);
}

#[tokio::test]
async fn test_invalid_schema_is_rejected() {
    let broken = r#"
entities:
  - name: Order
    table: orders
    relations:
      - name: lines
        target_type: OrderLine
        cardinality: many
        inverse: order
"#;
    let err = MetaModel::from_yaml_str(broken).unwrap_err();
    assert!(matches!(err, IntegrityError::IllegalState(_)));
    assert!(err.is_configuration_error());
}
