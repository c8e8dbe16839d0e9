use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};

use crate::entities::usage_logs;

pub const ACTION_LOGIN: &str = "login";
pub const ACTION_CONSUME_QUOTA: &str = "consume_quota";
pub const ACTION_REDEEM_CODE: &str = "redeem_code";

/// Append a usage-log row. Audit writes never fail the calling request;
/// a lost row is logged and dropped.
pub async fn record(db: &DatabaseConnection, user_id: i64, action: &str, detail: Option<String>) {
    let entry = usage_logs::ActiveModel {
        user_id: Set(user_id),
        action: Set(action.to_string()),
        detail: Set(detail),
        created_at: Set(Utc::now()),
        ..Default::default()
    };

    if let Err(e) = entry.insert(db).await {
        tracing::error!(user_id, action, "usage log write failed: {:?}", e);
    }
}
