//! Grouping keys and reductions for the six statistic tables
//!
//! Every record is folded into all six accumulators in one pass. Groups
//! live in ordered maps, so the rows produced for a given record set are
//! always the same rows in the same order.

use chrono::{Datelike, NaiveDate, Weekday};
use std::collections::{BTreeMap, HashSet};

use crate::db::{AccessStat, ActivityStat, BrowserStat, ErrorStat, LogRecord, ReferrerStat, VisitorStat};
use crate::parser::hour_of_day;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ActivityKey {
    date: NaiveDate,
    hour: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ErrorKey {
    status_code: i32,
    sub_status_code: i32,
    win32_status: i64,
    page: String,
}

#[derive(Debug, Default)]
struct ActivityTally {
    hits: i64,
    page_views: i64,
    visitors: HashSet<String>,
    bandwidth: i64,
}

/// Hit count, byte total and most recent date for one group
#[derive(Debug, Clone, Copy)]
struct Tally {
    hits: i64,
    bandwidth: i64,
    last_seen: NaiveDate,
}

impl Tally {
    fn new(date: NaiveDate) -> Self {
        Self {
            hits: 0,
            bandwidth: 0,
            last_seen: date,
        }
    }

    fn add(&mut self, record: &LogRecord) {
        self.hits += 1;
        self.bandwidth = self.bandwidth.saturating_add(record.bandwidth());
        self.last_seen = self.last_seen.max(record.date);
    }
}

/// All six tables' rows, ready to write
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StatSet {
    pub activity: Vec<ActivityStat>,
    pub access: Vec<AccessStat>,
    pub visitor: Vec<VisitorStat>,
    pub referrer: Vec<ReferrerStat>,
    pub browser: Vec<BrowserStat>,
    pub error: Vec<ErrorStat>,
}

#[derive(Debug, Default)]
pub struct Accumulators {
    activity: BTreeMap<ActivityKey, ActivityTally>,
    access: BTreeMap<String, Tally>,
    visitor: BTreeMap<String, Tally>,
    referrer: BTreeMap<String, Tally>,
    browser: BTreeMap<String, Tally>,
    error: BTreeMap<ErrorKey, Tally>,
}

impl Accumulators {
    pub fn add(&mut self, record: &LogRecord) {
        let key = ActivityKey {
            date: record.date,
            hour: hour_of_day(&record.time).unwrap_or(0),
        };
        let activity = self.activity.entry(key).or_default();
        activity.hits += 1;
        if is_page_view(&record.uri_stem) {
            activity.page_views += 1;
        }
        activity.visitors.insert(record.client_ip.clone());
        activity.bandwidth = activity.bandwidth.saturating_add(record.bandwidth());

        tally(&mut self.access, &record.uri_stem, record);
        tally(&mut self.visitor, &record.client_ip, record);
        if !record.referrer.is_empty() {
            tally(&mut self.referrer, &record.referrer, record);
        }
        tally(&mut self.browser, &record.user_agent, record);

        if record.status_code >= 400 {
            let key = ErrorKey {
                status_code: record.status_code,
                sub_status_code: record.sub_status_code,
                win32_status: record.win32_status,
                page: record.uri_stem.clone(),
            };
            self.error
                .entry(key)
                .or_insert_with(|| Tally::new(record.date))
                .add(record);
        }
    }

    pub fn finish(self) -> StatSet {
        let activity = self
            .activity
            .into_iter()
            .map(|(key, t)| ActivityStat {
                date: key.date,
                hour: key.hour as i32,
                day_of_week: day_name(key.date.weekday()).to_string(),
                week: key.date.iso_week().week() as i32,
                month: key.date.month() as i32,
                hits: t.hits,
                page_views: t.page_views,
                visitors: t.visitors.len() as i64,
                bandwidth: t.bandwidth,
            })
            .collect();

        let access = self
            .access
            .into_iter()
            .map(|(page, t)| AccessStat {
                directory: directory_of(&page),
                file_type: file_type_of(&page),
                page,
                virtual_domain: String::new(),
                hits: t.hits,
                bandwidth: t.bandwidth,
                last_access: t.last_seen,
            })
            .collect();

        let visitor = self
            .visitor
            .into_iter()
            .map(|(host, t)| VisitorStat {
                top_level_domain: top_level_domain(&host),
                host,
                country: String::new(),
                authenticated_user: String::new(),
                hits: t.hits,
                bandwidth: t.bandwidth,
                last_visit: t.last_seen,
            })
            .collect();

        let referrer = self
            .referrer
            .into_iter()
            .map(|(url, t)| ReferrerStat {
                site: referrer_site(&url).unwrap_or_default(),
                url,
                search_engine: String::new(),
                search_phrase: String::new(),
                hits: t.hits,
                last_referral: t.last_seen,
            })
            .collect();

        let browser = self
            .browser
            .into_iter()
            .map(|(agent, t)| BrowserStat {
                is_spider: is_spider(&agent),
                browser_type: agent,
                version: String::new(),
                operating_system: String::new(),
                device_type: String::new(),
                hits: t.hits,
                last_access: t.last_seen,
            })
            .collect();

        let error = self
            .error
            .into_iter()
            .map(|(key, t)| ErrorStat {
                status_code: key.status_code,
                sub_status_code: key.sub_status_code,
                win32_status: key.win32_status,
                page: key.page,
                count: t.hits,
                last_occurrence: t.last_seen,
            })
            .collect();

        StatSet {
            activity,
            access,
            visitor,
            referrer,
            browser,
            error,
        }
    }
}

fn tally(groups: &mut BTreeMap<String, Tally>, key: &str, record: &LogRecord) {
    // Avoid allocating a key for groups we have already seen
    match groups.get_mut(key) {
        Some(t) => t.add(record),
        None => {
            let mut t = Tally::new(record.date);
            t.add(record);
            groups.insert(key.to_string(), t);
        }
    }
}

fn day_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

fn last_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// A request counts as a page view when its final segment has no extension
pub fn is_page_view(uri_stem: &str) -> bool {
    !last_segment(uri_stem).contains('.')
}

pub fn directory_of(uri_stem: &str) -> String {
    match uri_stem.rfind('/') {
        Some(0) => "/".to_string(),
        Some(i) => uri_stem[..i].to_string(),
        None => String::new(),
    }
}

/// Extension of the final segment, dot included
pub fn file_type_of(uri_stem: &str) -> String {
    let segment = last_segment(uri_stem);
    match segment.rfind('.') {
        Some(i) => segment[i..].to_ascii_lowercase(),
        None => String::new(),
    }
}

/// Everything from the last `.` of the host, or empty
pub fn top_level_domain(host: &str) -> String {
    host.rfind('.')
        .map(|i| host[i..].to_string())
        .unwrap_or_default()
}

pub fn referrer_site(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    parsed.host_str().map(str::to_string)
}

pub fn is_spider(user_agent: &str) -> bool {
    let agent = user_agent.to_ascii_lowercase();
    agent.contains("bot") || agent.contains("spider")
}
