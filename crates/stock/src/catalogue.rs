use common::Money;

use crate::Product;

/// The demo catalogue inserted into an empty product table.
pub fn demo_catalogue() -> Vec<Product> {
    vec![
        Product::new("product-1", "Laptop", 10, Money::from_cents(99_999)),
        Product::new("product-2", "Mouse", 50, Money::from_cents(2_999)),
        Product::new("product-3", "Keyboard", 30, Money::from_cents(7_999)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogue_has_three_stocked_products() {
        let products = demo_catalogue();
        assert_eq!(products.len(), 3);
        assert!(products.iter().all(|p| p.quantity > 0 && p.price.is_positive()));
        assert_eq!(products[0].id.as_str(), "product-1");
        assert_eq!(products[0].quantity, 10);
    }
}
