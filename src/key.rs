//! Cache key and document path utilities.

/// Builder for cache keys and document paths.
pub struct KeyBuilder;

impl KeyBuilder {
    /// Cache key for an entity: `"{collection}:{id}"`.
    pub fn cache_key(collection: &str, id: &str) -> String {
        format!("{}:{}", collection, id)
    }

    /// Store path for a document: `"{collection}/{id}"`.
    pub fn document_path(collection: &str, id: &str) -> String {
        format!("{}/{}", collection, id)
    }

    /// Split a cache key back into `(collection, id)`.
    ///
    /// Only the first `:` separates; ids may contain further colons.
    pub fn parse_cache_key(key: &str) -> Option<(&str, &str)> {
        key.split_once(':')
    }

    /// Split a document path back into `(collection, id)`.
    ///
    /// Ids never contain `/`, so the last separator splits.
    pub fn parse_document_path(path: &str) -> Option<(&str, &str)> {
        path.rsplit_once('/')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key() {
        assert_eq!(KeyBuilder::cache_key("products", "w1"), "products:w1");
    }

    #[test]
    fn test_document_path() {
        assert_eq!(KeyBuilder::document_path("products", "w1"), "products/w1");
    }

    #[test]
    fn test_parse_cache_key_keeps_colons_in_id() {
        assert_eq!(
            KeyBuilder::parse_cache_key("products:sku:42"),
            Some(("products", "sku:42"))
        );
        assert_eq!(KeyBuilder::parse_cache_key("nokey"), None);
    }

    #[test]
    fn test_parse_document_path() {
        assert_eq!(
            KeyBuilder::parse_document_path("tenants/acme/products/w1"),
            Some(("tenants/acme/products", "w1"))
        );
        assert_eq!(KeyBuilder::parse_document_path("w1"), None);
    }
}
