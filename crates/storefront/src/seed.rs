// Demo data for a fresh database

use assoc_types::GenericReference;
use chrono::Utc;
use serde::Serialize;
use tracing::info;

use crate::catalog::{Article, Collection, Customer, Membership, Order, PaymentStatus, Product, User};
use crate::error::Result;
use crate::listing::Listing;

/// What `seed_demo` inserted
#[derive(Debug, Clone, Default, Serialize)]
pub struct SeedSummary {
    /// Nothing was inserted because the catalog already had products
    pub skipped: bool,
    pub collections: usize,
    pub products: usize,
    pub articles: usize,
    pub customers: usize,
    pub orders: usize,
    pub users: usize,
    pub associations: usize,
}

const COLLECTIONS: [&str; 3] = ["Beauty", "Baking", "Stationery"];

const PRODUCTS: [(&str, f64, u32, usize); 8] = [
    ("Lip balm", 4.5, 120, 0),
    ("Face mask", 12.0, 40, 0),
    ("Sourdough starter", 9.99, 15, 1),
    ("Rolling pin", 18.0, 30, 1),
    ("Piping bags", 6.25, 200, 1),
    ("Fountain pen", 45.0, 12, 2),
    ("Notebook", 8.0, 90, 2),
    ("Ink refill", 3.5, 300, 2),
];

const CUSTOMERS: [(&str, &str, Membership, &[f64]); 3] = [
    ("Ada", "Lovelace", Membership::Gold, &[120.5, 18.0, 45.0]),
    ("Alan", "Turing", Membership::Silver, &[9.99]),
    ("Grace", "Hopper", Membership::Bronze, &[]),
];

const USERS: [&str; 3] = ["admin", "editor", "viewer"];

/// Insert a small catalog with tags and likes
///
/// Does nothing if products already exist.
pub fn seed_demo(listing: &Listing) -> Result<SeedSummary> {
    let catalog = listing.catalog();
    if !catalog.products.is_empty()? {
        info!("Catalog already populated, skipping seed");
        return Ok(SeedSummary {
            skipped: true,
            ..Default::default()
        });
    }

    let mut summary = SeedSummary::default();
    let types = *listing.types();

    let mut collections = Vec::new();
    for title in COLLECTIONS {
        let collection = catalog.collections.insert(|id| Collection {
            id,
            title: title.to_string(),
        })?;
        collections.push(collection.id);
    }
    summary.collections = collections.len();

    let mut products = Vec::new();
    for (title, unit_price, inventory, collection) in PRODUCTS {
        let product = catalog.products.insert(|id| Product {
            id,
            title: title.to_string(),
            unit_price,
            inventory,
            collection_id: collections[collection],
        })?;
        products.push(product.id);
    }
    summary.products = products.len();

    let article = catalog.articles.insert(|id| Article {
        id,
        title: "Spring sale is here".to_string(),
    })?;
    summary.articles = 1;

    for (first_name, last_name, membership, totals) in CUSTOMERS {
        let customer = catalog.customers.insert(|id| Customer {
            id,
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            email: format!("{}@example.com", first_name.to_lowercase()),
            membership,
        })?;
        for total in totals {
            catalog.orders.insert(|id| Order {
                id,
                customer_id: customer.id,
                placed_at: Utc::now(),
                payment_status: PaymentStatus::Complete,
                total: *total,
            })?;
            summary.orders += 1;
        }
        summary.customers += 1;
    }

    let mut users = Vec::new();
    for username in USERS {
        let user = catalog.users.insert(|id| User {
            id,
            username: username.to_string(),
            email: format!("{}@example.com", username),
        })?;
        users.push(user.id);
    }
    summary.users = users.len();

    let mut attach = |owner: GenericReference, labels: &[&str]| -> Result<()> {
        for label in labels {
            listing.tag(owner, label)?;
            summary.associations += 1;
        }
        Ok(())
    };
    attach(GenericReference::new(types.product, products[0]), &["sale", "new"])?;
    attach(GenericReference::new(types.product, products[2]), &["sale"])?;
    attach(GenericReference::new(types.product, products[5]), &["gift", "premium"])?;
    attach(GenericReference::new(types.article, article.id), &["sale"])?;

    for (n, product) in products.iter().enumerate() {
        let owner = GenericReference::new(types.product, *product);
        for user in users.iter().take(n % 3 + 1) {
            listing.like(owner, *user)?;
            summary.associations += 1;
        }
    }

    info!(
        "Seeded {} products, {} customers and {} associations",
        summary.products, summary.customers, summary.associations
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListingConfig;
    use assoc_store::Storage;

    #[test]
    fn test_seed_runs_once() {
        let listing = Listing::open(Storage::in_memory().unwrap(), ListingConfig::default()).unwrap();

        let first = seed_demo(&listing).unwrap();
        let second = seed_demo(&listing).unwrap();

        assert!(!first.skipped);
        assert_eq!(first.products, 8);
        assert_eq!(first.orders, 4);
        assert!(second.skipped);
        assert_eq!(listing.catalog().products.len().unwrap(), 8);
    }

    #[test]
    fn test_seeded_listings() {
        let listing = Listing::open(Storage::in_memory().unwrap(), ListingConfig::default()).unwrap();
        seed_demo(&listing).unwrap();

        let products = listing.product_page(0).unwrap();
        assert_eq!(products[0].tags, vec!["sale", "new"]);
        assert_eq!(products[0].likes, 1);
        assert_eq!(products[1].likes, 2);

        let customers = listing.customer_page(0).unwrap();
        assert_eq!(customers[0].orders_count, 3);
        assert_eq!(customers[2].orders_count, 0);
    }
}
