//! Database integration tests.

use super::*;
use crate::error::AppError;
use crate::models::activity::*;
use crate::models::page::*;
use crate::models::queue::*;
use crate::test_support::{assert_versions_contiguous, at, setup_temp_db};
use chrono::Duration;
use std::sync::{Arc, Barrier};
use std::thread;

fn snapshot(title: &str, rating: i64) -> PageSnapshot {
    PageSnapshot {
        title: title.to_string(),
        tags: vec!["scp".to_string(), "原创".to_string()],
        rating: Some(rating),
        vote_count: Some(rating.unsigned_abs() as u32),
        revision_count: Some(1),
        content: Some(format!("{} body", title)),
        ..PageSnapshot::default()
    }
}

fn attribution(user: &str, role: AttributionRole) -> Attribution {
    Attribution {
        page_url: String::new(),
        version_seq: 0,
        user_id: user.to_string(),
        role,
        order_index: 0,
        date: None,
    }
}

mod activity;
mod startup;
mod versions;
