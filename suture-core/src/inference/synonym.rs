//! Synonym dictionary for field-name matching.
//!
//! Character similarity cannot tell that `uid` and `user_id` mean the same
//! thing; the dictionary can. A term may belong to several groups, and two
//! names match when they share at least one group.

use std::collections::HashMap;
use std::sync::LazyLock;

/// Groups of interchangeable field names, written in normalized snake_case.
pub static SYNONYM_GROUPS: &[&[&str]] = &[
    // Identity
    &["id", "identifier", "key", "uuid", "guid", "pk", "primary_key"],
    &["user_id", "uid", "user_key", "account_id", "member_id", "person_id", "customer_id", "usr_id"],
    &["product_id", "pid", "item_id", "sku", "article_id", "prod_id"],
    &["order_id", "oid", "purchase_id", "transaction_id", "order_number", "order_no"],
    // Names
    &["name", "full_name", "fullname", "display_name", "user_name", "person_name"],
    &["title", "name", "label", "product_name", "item_name", "heading"],
    &["first_name", "given_name", "fname", "forename"],
    &["last_name", "family_name", "surname", "lname"],
    &["username", "login", "handle", "screen_name", "nickname"],
    // Contact
    &["email", "mail", "e_mail", "email_address", "mail_address", "contact_email"],
    &["phone", "telephone", "mobile", "cell", "phone_number", "tel"],
    &["address", "location", "addr", "street_address"],
    // Time
    &["created_at", "created", "creation_date", "create_date", "date_created", "registered_at", "signup_date", "timestamp", "created_on"],
    &["updated_at", "updated", "modified", "modified_at", "last_modified"],
    &["expires_at", "expiry", "expiration", "valid_until"],
    // Status
    &["status", "state", "order_status", "condition", "phase"],
    &["in_stock", "available", "is_available", "stock_available", "has_stock", "instock"],
    &["active", "enabled", "is_active"],
    // Money and quantities
    &["price", "cost", "unit_price", "amount", "price_usd", "fee"],
    &["total_amount", "total", "amount", "grand_total", "order_total", "sum", "total_price"],
    &["count", "qty", "quantity", "num"],
    // Content
    &["description", "desc", "summary", "details", "about"],
    &["url", "link", "href", "uri"],
    &["type", "kind", "category", "class"],
];

/// Normalized term → indices of the groups it belongs to.
static SYNONYM_INDEX: LazyLock<HashMap<&'static str, Vec<usize>>> = LazyLock::new(|| {
    let mut map: HashMap<&'static str, Vec<usize>> = HashMap::with_capacity(256);
    for (idx, group) in SYNONYM_GROUPS.iter().enumerate() {
        for &term in *group {
            map.entry(term).or_default().push(idx);
        }
    }
    map
});

/// Score two field names via the dictionary.
///
/// - `1.0` identical after normalization
/// - `0.95` share a synonym group
/// - `0.0` otherwise
#[inline]
pub fn synonym_match(field_a: &str, field_b: &str) -> f32 {
    let norm_a = normalize_field_name(field_a);
    let norm_b = normalize_field_name(field_b);

    if norm_a == norm_b {
        return 1.0;
    }

    match (SYNONYM_INDEX.get(norm_a.as_str()), SYNONYM_INDEX.get(norm_b.as_str())) {
        (Some(a), Some(b)) if a.iter().any(|g| b.contains(g)) => 0.95,
        _ => 0.0,
    }
}

/// Normalize a field name: camelCase to snake_case, lowercase, common
/// accessor prefixes stripped.
#[inline]
pub fn normalize_field_name(name: &str) -> String {
    let mut snake = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for c in name.chars() {
        if c == '-' || c == ' ' || c == '.' {
            snake.push('_');
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower {
            snake.push('_');
        }
        prev_lower = c.is_lowercase() || c.is_ascii_digit();
        snake.push(c.to_ascii_lowercase());
    }

    let stripped = snake
        .strip_prefix("get_")
        .or_else(|| snake.strip_prefix("_"))
        .unwrap_or(&snake);

    stripped.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synonym_groups() {
        assert!(synonym_match("uid", "user_id") > 0.9);
        assert!(synonym_match("full_name", "name") > 0.9);
        assert!(synonym_match("email_address", "email") > 0.9);
        assert!(synonym_match("cost", "price") > 0.9);
    }

    #[test]
    fn test_term_in_several_groups() {
        // "name" is both a person name and a product title
        assert!(synonym_match("name", "title") > 0.9);
        assert!(synonym_match("name", "full_name") > 0.9);
        assert_eq!(synonym_match("full_name", "heading"), 0.0);
    }

    #[test]
    fn test_normalization() {
        assert_eq!(normalize_field_name("userId"), "user_id");
        assert_eq!(normalize_field_name("emailAddress"), "email_address");
        assert_eq!(normalize_field_name("created-at"), "created_at");
        assert_eq!(normalize_field_name("getName"), "name");
        assert_eq!(synonym_match("userId", "user_id"), 1.0);
    }

    #[test]
    fn test_no_match() {
        assert_eq!(synonym_match("email", "status"), 0.0);
        assert_eq!(synonym_match("user_id", "timestamp"), 0.0);
    }
}
