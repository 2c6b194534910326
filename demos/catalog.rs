//! Product catalog walkthrough: lifecycle, caching, batches and tenants.

use repo_kit::{
    error::Result, store::MemoryStore, CacheStrategy, CreateOptions, DeleteOptions, Direction,
    Entity, Filter, QueryOptions, ReadOptions, Repository, RepositoryConfig, TenantRepository,
    UpdateOptions,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Example entity: Product
#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Product {
    name: String,
    sku: String,
    price: f64,
    #[serde(default)]
    organization_id: Option<String>,
}

impl Entity for Product {
    fn collection() -> &'static str {
        "products"
    }
}

fn product(name: &str, sku: &str, price: f64) -> Product {
    Product {
        name: name.to_string(),
        sku: sku.to_string(),
        price,
        organization_id: None,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Debug)
        .try_init()
        .ok();

    println!("\n=== Repo Kit - Catalog Example ===\n");

    // 1. Build the repository
    println!("1. Building product repository over the in-memory store...");
    let store = MemoryStore::new();
    let config = RepositoryConfig::new("products").with_required_fields(["name", "sku"]);
    let products: Repository<Product, MemoryStore> = Repository::new(store.clone(), config)?;
    println!("   ✓ Repository ready\n");

    // 2. Create
    println!("2. Creating a product with a custom id:");
    let widget = products
        .create(product("Widget", "W-1", 9.99), CreateOptions::default().with_id("w1"))
        .await?;
    println!(
        "   ✓ Created {} (version {:?}, created {})\n",
        widget.id, widget.version, widget.created_at
    );

    // 3. Cached reads
    println!("3. Reading twice (second read is served from cache):");
    products.get("w1").await?;
    products.get("w1").await?;
    let stats = products.get_stats();
    println!(
        "   ✓ {} store reads, {} cache hits\n",
        stats.reads, stats.cache_hits
    );

    // 4. Update
    println!("4. Updating the price:");
    let updated = products
        .update("w1", &json!({"price": 12.5}), UpdateOptions::default())
        .await?;
    println!(
        "   ✓ {} now costs {:.2} (version {:?})\n",
        updated.name, updated.price, updated.version
    );

    // 5. Batch create
    println!("5. Creating a batch of products:");
    let result = products
        .create_batch(vec![
            product("Gadget", "G-1", 19.0),
            product("Gizmo", "Z-1", 4.5),
            product("Doohickey", "D-1", 7.25),
        ])
        .await;
    println!("   ✓ Batch {:?}: {} written\n", result.status, result.written_count);

    // 6. Query and paginate
    println!("6. Paginating by price:");
    let page = products
        .paginate_with(
            vec![Filter::new("price", repo_kit::FilterOp::Lt, 15.0)],
            1,
            2,
            QueryOptions::default().with_order_by("price", Direction::Ascending),
        )
        .await?;
    for item in &page.items {
        println!("   - {} ({:.2})", item.name, item.price);
    }
    println!(
        "   ✓ Page {}/{} of {} matching products\n",
        page.page, page.total_pages, page.total
    );

    // 7. Soft delete and restore
    println!("7. Soft-deleting and restoring w1:");
    products.delete("w1", DeleteOptions::soft()).await?;
    let hidden = products.find_by_id("w1", ReadOptions::default()).await?;
    println!("   ✓ Visible after delete: {}", hidden.is_some());
    let restored = products.restore("w1").await?;
    println!("   ✓ Restored (version {:?})\n", restored.version);

    // 8. Bypass the cache
    println!("8. Reading straight from the store:");
    let fresh = products
        .find_by_id("w1", ReadOptions::default().with_strategy(CacheStrategy::Bypass))
        .await?;
    println!("   ✓ Found: {}\n", fresh.is_some());

    // 9. Tenants
    println!("9. Tenant-scoped repository:");
    let tenants = TenantRepository::new(products.clone());
    tenants
        .create_for_tenant("acme", product("Anvil", "A-1", 99.0), CreateOptions::default())
        .await?;
    let acme = tenants
        .count_for_tenant("acme", vec![])
        .await?;
    let globex = tenants
        .count_for_tenant("globex", vec![])
        .await?;
    println!("   ✓ acme sees {}, globex sees {}\n", acme, globex);

    println!("=== Example Complete ===\n");
    println!("Final stats: {:?}", products.get_stats());

    Ok(())
}
