//! Business event classification
//!
//! Maps the shape of an API call to at most one domain event. Rules are
//! checked in a fixed order and the first match wins:
//!
//! 1. `GET` under `/products` with `/search` in the path: `search`
//! 2. `GET /products/<id>[/...]`: `product_view`
//! 3. `POST` to `/cart`: `cart_add`
//! 4. `POST` to `/orders`: `purchase_complete`
//!
//! Rule 1 must stay ahead of rule 2, otherwise `/products/search` would be
//! read as a view of a product called `search`.

use crate::events::{Attributes, BusinessEvent, BusinessEventType};
use crate::serialize::{to_json, DEFAULT_MAX_DEPTH};
use crate::value::TraceValue;
use http::Method;
use once_cell::sync::Lazy;
use regex::Regex;

static PRODUCT_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/products/([^/?#]+)").expect("valid product id pattern"));

/// Classify a call. Never fails; unknown shapes yield `None`.
pub fn classify(method: &Method, url: &str, body: Option<&TraceValue>) -> Option<BusinessEvent> {
    let path = path_of(url);

    if path.contains("/products") && *method == Method::GET && path.contains("/search") {
        return Some(BusinessEvent::new(
            BusinessEventType::Search,
            search_data(url),
        ));
    }

    if path.contains("/products/") && *method == Method::GET && !path.contains("/search") {
        let product_id = PRODUCT_ID
            .captures(path)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())?;
        let mut data = Attributes::new();
        data.insert("product_id".to_string(), product_id.into());
        return Some(BusinessEvent::new(BusinessEventType::ProductView, data));
    }

    if path.contains("/cart") && *method == Method::POST {
        return Some(BusinessEvent::new(
            BusinessEventType::CartAdd,
            body_data(body),
        ));
    }

    if path.contains("/orders") && *method == Method::POST {
        return Some(BusinessEvent::new(
            BusinessEventType::PurchaseComplete,
            body_data(body),
        ));
    }

    None
}

/// URL path without scheme, host, query or fragment
fn path_of(url: &str) -> &str {
    let without_fragment = url.split('#').next().unwrap_or(url);
    let without_query = without_fragment
        .split('?')
        .next()
        .unwrap_or(without_fragment);

    match without_query.find("://") {
        Some(scheme_end) => {
            let rest = &without_query[scheme_end + 3..];
            rest.find('/').map(|i| &rest[i..]).unwrap_or("/")
        }
        None => without_query,
    }
}

fn query_of(url: &str) -> Option<&str> {
    let without_fragment = url.split('#').next().unwrap_or(url);
    without_fragment.split_once('?').map(|(_, q)| q)
}

fn search_data(url: &str) -> Attributes {
    let mut data = Attributes::new();
    let Some(query) = query_of(url) else {
        return data;
    };

    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if key == "q" && !data.contains_key("query") {
            data.insert("query".to_string(), value.to_string().into());
        }
        data.insert(format!("param.{}", key), value.into_owned().into());
    }
    data
}

/// Body fields, flattened one level; non-object bodies land under `body`
fn body_data(body: Option<&TraceValue>) -> Attributes {
    let mut data = Attributes::new();
    match body.map(|b| to_json(b, DEFAULT_MAX_DEPTH)) {
        Some(serde_json::Value::Object(fields)) => {
            data.extend(fields);
        }
        Some(serde_json::Value::Null) | None => {}
        Some(other) => {
            data.insert("body".to_string(), other);
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind(method: Method, url: &str) -> Option<BusinessEventType> {
        classify(&method, url, None).map(|e| e.event_type)
    }

    #[test]
    fn test_search_wins_over_product_view() {
        let event = classify(&Method::GET, "/products/search?q=laptop", None).unwrap();
        assert_eq!(event.event_type, BusinessEventType::Search);
        assert_eq!(event.data.get("query"), Some(&serde_json::json!("laptop")));
        assert_eq!(event.data.get("param.q"), Some(&serde_json::json!("laptop")));
    }

    #[test]
    fn test_search_query_parameters() {
        let event = classify(
            &Method::GET,
            "https://shop.example.com/api/products/search?q=red+shoes&page=2",
            None,
        )
        .unwrap();
        assert_eq!(event.data.get("query"), Some(&serde_json::json!("red shoes")));
        assert_eq!(event.data.get("param.page"), Some(&serde_json::json!("2")));
    }

    #[test]
    fn test_product_view_id_extraction() {
        for url in [
            "/products/PROD-123",
            "/products/PROD-123/reviews",
            "/products/PROD-123?ref=home",
            "https://api.example.com/v1/products/PROD-123",
        ] {
            let event = classify(&Method::GET, url, None).unwrap();
            assert_eq!(event.event_type, BusinessEventType::ProductView, "{}", url);
            assert_eq!(
                event.data.get("product_id"),
                Some(&serde_json::json!("PROD-123")),
                "{}",
                url
            );
        }
    }

    #[test]
    fn test_product_listing_is_not_a_view() {
        assert_eq!(kind(Method::GET, "/products"), None);
        assert_eq!(kind(Method::GET, "/products/"), None);
        assert_eq!(kind(Method::GET, "/api/products?category=tv"), None);
    }

    #[test]
    fn test_cart_add_carries_body() {
        let body = TraceValue::from(serde_json::json!({"sku": "X", "quantity": 1}));
        let event = classify(&Method::POST, "/cart", Some(&body)).unwrap();
        assert_eq!(event.event_type, BusinessEventType::CartAdd);
        assert_eq!(event.data.get("sku"), Some(&serde_json::json!("X")));
        assert_eq!(event.data.get("quantity"), Some(&serde_json::json!(1)));
    }

    #[test]
    fn test_purchase_complete() {
        let body = TraceValue::from(serde_json::json!({"total": 99.5, "items": ["X"]}));
        let event = classify(&Method::POST, "/api/orders", Some(&body)).unwrap();
        assert_eq!(event.event_type, BusinessEventType::PurchaseComplete);
        assert_eq!(event.data.get("total"), Some(&serde_json::json!(99.5)));
    }

    #[test]
    fn test_method_matters() {
        assert_eq!(kind(Method::GET, "/cart"), None);
        assert_eq!(kind(Method::GET, "/orders"), None);
        assert_eq!(kind(Method::POST, "/products/PROD-1"), None);
        assert_eq!(kind(Method::DELETE, "/cart"), None);
    }

    #[test]
    fn test_non_object_body() {
        let body = TraceValue::string("raw");
        let event = classify(&Method::POST, "/cart", Some(&body)).unwrap();
        assert_eq!(event.data.get("body"), Some(&serde_json::json!("raw")));

        let empty = classify(&Method::POST, "/cart", None).unwrap();
        assert!(empty.data.is_empty());
    }

    #[test]
    fn test_cyclic_body_is_safe() {
        let body = TraceValue::object();
        body.insert("sku", TraceValue::string("X"));
        body.insert("self", body.clone());
        let event = classify(&Method::POST, "/cart", Some(&body)).unwrap();
        assert_eq!(
            event.data.get("self"),
            Some(&serde_json::json!(crate::serialize::CIRCULAR_MARKER))
        );
    }

    #[test]
    fn test_unrelated_calls() {
        assert_eq!(kind(Method::GET, "/api/users/me"), None);
        assert_eq!(kind(Method::POST, "/api/login"), None);
    }
}
