//! Property-based tests for conversion, validation and page arithmetic.
//!
//! # Properties Tested
//!
//! 1. **Conversion Property**: from_storage(to_storage(r)) == r for ANY record
//! 2. **Id Property**: the stored document never carries the id field
//! 3. **Validation Property**: ids are accepted iff they are non-empty,
//!    separator-free, not `.`/`..` and within the byte limit
//! 4. **Page Property**: page navigation fields agree with `total`

use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;
use repo_kit::convert::Converter;
use repo_kit::store::Snapshot;
use repo_kit::validate::Validator;
use repo_kit::{Entity, Page, Record};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Article {
    title: String,
    views: i64,
    tags: Vec<String>,
    published: bool,
}

impl Entity for Article {
    fn collection() -> &'static str {
        "articles"
    }
}

fn timestamp() -> impl Strategy<Value = DateTime<Utc>> {
    (0i64..4_102_444_800, 0u32..1_000_000_000).prop_map(|(secs, nanos)| {
        Utc.timestamp_opt(secs, nanos)
            .single()
            .unwrap_or_else(Utc::now)
    })
}

fn article() -> impl Strategy<Value = Article> {
    (
        ".*",
        any::<i64>(),
        prop::collection::vec("[a-z]{1,8}", 0..5),
        any::<bool>(),
    )
        .prop_map(|(title, views, tags, published)| Article {
            title,
            views,
            tags,
            published,
        })
}

fn record() -> impl Strategy<Value = Record<Article>> {
    (
        "[A-Za-z0-9_-]{1,32}",
        timestamp(),
        timestamp(),
        prop::option::of(timestamp()),
        prop::option::of(1u64..1_000_000),
        article(),
    )
        .prop_map(|(id, created_at, updated_at, deleted_at, version, data)| Record {
            id,
            created_at,
            updated_at,
            is_deleted: deleted_at.is_some(),
            deleted_at,
            version,
            data,
        })
}

proptest! {
    #[test]
    fn prop_conversion_preserves_record(record in record()) {
        let converter: Converter<Article> = Converter::new("articles", &[]);
        let doc = converter.to_storage(&record).expect("to_storage");
        prop_assert!(!doc.contains_key("id"));

        let snapshot = Snapshot {
            id: record.id.clone(),
            data: doc,
            revision: 1,
            update_time: record.updated_at,
        };
        let back = converter.from_storage(&snapshot).expect("from_storage");
        prop_assert_eq!(back, record);
    }

    #[test]
    fn prop_id_validation(id in "\\PC{0,40}") {
        let validator = Validator::new("articles").with_max_id_len(32);
        let expected = !id.is_empty()
            && !id.contains('/')
            && !id.contains('\\')
            && id != "."
            && id != ".."
            && id.len() <= 32;
        prop_assert_eq!(validator.validate_id(&id).is_ok(), expected);
    }

    #[test]
    fn prop_page_navigation(total in 0u64..10_000, page in 1u64..200, page_size in 1u64..100) {
        let p: Page<()> = Page::new(Vec::new(), total, page, page_size);
        prop_assert!(p.total_pages * page_size >= total);
        prop_assert!(p.total_pages == 0 || (p.total_pages - 1) * page_size < total);
        prop_assert_eq!(p.has_next, page < p.total_pages);
        prop_assert_eq!(p.has_previous, page > 1);
        prop_assert_eq!(Page::<()>::offset(page, page_size), (page - 1) * page_size);
    }
}
