pub use super::history_records::Entity as HistoryRecords;
pub use super::redeem_codes::Entity as RedeemCodes;
pub use super::usage_logs::Entity as UsageLogs;
pub use super::users::Entity as Users;
