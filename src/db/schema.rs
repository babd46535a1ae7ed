//! Database schema definitions

pub const CREATE_LOG_ENTRIES: &str = r#"
CREATE TABLE IF NOT EXISTS log_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_name TEXT NOT NULL,
    date TEXT NOT NULL,             -- YYYY-MM-DD
    time TEXT NOT NULL,             -- HH:MM:SS as logged, may be empty
    server_ip TEXT NOT NULL,
    method TEXT NOT NULL,
    uri_stem TEXT NOT NULL,
    uri_query TEXT NOT NULL,
    port INTEGER NOT NULL DEFAULT 0,
    username TEXT NOT NULL,
    client_ip TEXT NOT NULL,
    user_agent TEXT NOT NULL,
    referrer TEXT NOT NULL,
    status_code INTEGER NOT NULL DEFAULT 0,
    sub_status_code INTEGER NOT NULL DEFAULT 0,
    win32_status INTEGER NOT NULL DEFAULT 0,
    time_taken INTEGER NOT NULL DEFAULT 0,
    bytes_sent INTEGER NOT NULL DEFAULT 0,
    bytes_received INTEGER NOT NULL DEFAULT 0
)
"#;

// === STATISTIC TABLES (fully rebuilt by every aggregation pass) ===

pub const CREATE_STAT_ACTIVITY: &str = r#"
CREATE TABLE IF NOT EXISTS stat_activity (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    date TEXT NOT NULL,
    hour INTEGER NOT NULL,
    day_of_week TEXT NOT NULL,
    week INTEGER NOT NULL,
    month INTEGER NOT NULL,
    hits INTEGER NOT NULL,
    page_views INTEGER NOT NULL,
    visitors INTEGER NOT NULL,
    bandwidth INTEGER NOT NULL
)
"#;

pub const CREATE_STAT_ACCESS: &str = r#"
CREATE TABLE IF NOT EXISTS stat_access (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    page TEXT NOT NULL,
    directory TEXT NOT NULL,
    file_type TEXT NOT NULL,
    virtual_domain TEXT NOT NULL DEFAULT '',
    hits INTEGER NOT NULL,
    bandwidth INTEGER NOT NULL,
    last_access TEXT NOT NULL
)
"#;

pub const CREATE_STAT_VISITOR: &str = r#"
CREATE TABLE IF NOT EXISTS stat_visitor (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    host TEXT NOT NULL,
    top_level_domain TEXT NOT NULL,
    country TEXT NOT NULL DEFAULT '',
    authenticated_user TEXT NOT NULL DEFAULT '',
    hits INTEGER NOT NULL,
    bandwidth INTEGER NOT NULL,
    last_visit TEXT NOT NULL
)
"#;

pub const CREATE_STAT_REFERRER: &str = r#"
CREATE TABLE IF NOT EXISTS stat_referrer (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    site TEXT NOT NULL,
    url TEXT NOT NULL,
    search_engine TEXT NOT NULL DEFAULT '',
    search_phrase TEXT NOT NULL DEFAULT '',
    hits INTEGER NOT NULL,
    last_referral TEXT NOT NULL
)
"#;

pub const CREATE_STAT_BROWSER: &str = r#"
CREATE TABLE IF NOT EXISTS stat_browser (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    browser_type TEXT NOT NULL,
    version TEXT NOT NULL DEFAULT '',
    operating_system TEXT NOT NULL DEFAULT '',
    device_type TEXT NOT NULL DEFAULT '',
    is_spider BOOLEAN NOT NULL,
    hits INTEGER NOT NULL,
    last_access TEXT NOT NULL
)
"#;

pub const CREATE_STAT_ERROR: &str = r#"
CREATE TABLE IF NOT EXISTS stat_error (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    status_code INTEGER NOT NULL,
    sub_status_code INTEGER NOT NULL,
    win32_status INTEGER NOT NULL,
    page TEXT NOT NULL,
    count INTEGER NOT NULL,
    last_occurrence TEXT NOT NULL
)
"#;

// === LOG ENTRY INDEXES ===

// For the already-ingested file check
pub const CREATE_INDEX_FILE_NAME: &str =
    "CREATE INDEX IF NOT EXISTS idx_entries_file_name ON log_entries(file_name)";

pub const CREATE_INDEX_DATE: &str =
    "CREATE INDEX IF NOT EXISTS idx_entries_date ON log_entries(date)";

pub const CREATE_INDEX_CLIENT_IP: &str =
    "CREATE INDEX IF NOT EXISTS idx_entries_client_ip ON log_entries(client_ip)";

pub const CREATE_INDEX_URI_STEM: &str =
    "CREATE INDEX IF NOT EXISTS idx_entries_uri_stem ON log_entries(uri_stem)";

pub const CREATE_INDEX_STATUS: &str =
    "CREATE INDEX IF NOT EXISTS idx_entries_status ON log_entries(status_code)";

/// Every statement needed to bring an empty database up to date, in order
pub const MIGRATIONS: &[&str] = &[
    CREATE_LOG_ENTRIES,
    CREATE_STAT_ACTIVITY,
    CREATE_STAT_ACCESS,
    CREATE_STAT_VISITOR,
    CREATE_STAT_REFERRER,
    CREATE_STAT_BROWSER,
    CREATE_STAT_ERROR,
    CREATE_INDEX_FILE_NAME,
    CREATE_INDEX_DATE,
    CREATE_INDEX_CLIENT_IP,
    CREATE_INDEX_URI_STEM,
    CREATE_INDEX_STATUS,
];
