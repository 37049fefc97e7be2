//! Moodle adapter: authenticated session, booking-page parsing, and the
//! register/unregister calls.
//!
//! Everything here is the thin, replaceable layer between the remote
//! HTML and the core's slot model. Parsing failures surface as
//! `SeekerError::Parse`, distinct from network failures, so the
//! orchestrator never wastes retries on a page whose shape changed.
//!
//! Page anatomy (as observed): a calendar of `td.alert-success` cells
//! linking to per-day pages (`day=YYYY-MM-DD`), per-day time cells
//! linking to registration (`slot=<id>`), and per-section reserved-slot
//! tables under an `h4` headed "Vaše rezervované termíny" with an
//! unregister link and a `(do DD.MM. HH:MM)` deadline.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info, warn};

use crate::booking::{ReservationAgent, ReservedHold};
use crate::config::MoodleConfig;
use crate::error::{Result, SeekerError};
use crate::slot::{PageRef, Slot};
use crate::source::{SlotSnapshot, SlotSource};

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Marker text confirming a registration took effect.
const RESERVED_MARKER: &str = "rezervovaný termín";
/// Marker text confirming an unregistration took effect.
const RELEASED_MARKER: &str = "odhlášen";

fn sel(selector: &str) -> Selector {
    Selector::parse(selector).expect("static selector")
}

/// Authenticated HTTP session against one Moodle instance.
///
/// The cookie jar lives inside the reqwest client; re-authentication
/// happens transparently when a fetch lands back on the login page.
pub struct MoodleClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl MoodleClient {
    pub fn new(config: &MoodleConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn login_url(&self) -> String {
        format!("{}/login/index.php", self.base_url)
    }

    /// Authenticate: pull the hidden login token off the login page, then
    /// post credentials with it.
    pub async fn login(&self) -> Result<()> {
        info!("authenticating against {}", self.base_url);

        let login_page = self
            .http
            .get(self.login_url())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let token = extract_login_token(&login_page).ok_or_else(|| SeekerError::Auth {
            reason: "login token not found on login page".to_string(),
        })?;

        self.http
            .post(self.login_url())
            .form(&[
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
                ("logintoken", token.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?;

        if self.is_authenticated().await? {
            info!("authenticated with Moodle");
            Ok(())
        } else {
            Err(SeekerError::Auth {
                reason: "login rejected, check credentials".to_string(),
            })
        }
    }

    /// Whether the session cookie still opens the dashboard.
    pub async fn is_authenticated(&self) -> Result<bool> {
        let response = self
            .http
            .get(format!("{}/my/", self.base_url))
            .send()
            .await?;
        let landed_on_login = response.url().path().contains("login/index.php");
        Ok(response.status().is_success() && !landed_on_login)
    }

    /// Fetch a page, re-authenticating once if the session expired.
    pub async fn fetch_page(&self, url: &str) -> Result<String> {
        match self.fetch_page_once(url).await {
            Err(SeekerError::SessionExpired) => {
                warn!("session expired, re-authenticating");
                self.login().await?;
                self.fetch_page_once(url).await
            }
            other => other,
        }
    }

    async fn fetch_page_once(&self, url: &str) -> Result<String> {
        let response = self.http.get(url).send().await?;
        if response.url().path().contains("login/index.php") {
            return Err(SeekerError::SessionExpired);
        }
        Ok(response.error_for_status()?.text().await?)
    }
}

impl fmt::Debug for MoodleClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MoodleClient")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .finish()
    }
}

/// [`SlotSource`] over a Moodle booking page.
#[derive(Debug, Clone)]
pub struct MoodleSlotSource {
    client: Arc<MoodleClient>,
}

impl MoodleSlotSource {
    pub fn new(client: Arc<MoodleClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SlotSource for MoodleSlotSource {
    async fn fetch(&self, page: &PageRef) -> Result<SlotSnapshot> {
        let html = self.client.fetch_page(&page.url).await?;

        let held: Vec<Slot> =
            parse_reserved_slots(&html, page.test_section.as_deref(), Utc::now().date_naive())
                .into_iter()
                .map(|cell| cell.into_slot(&page.url))
                .collect();

        let section_label = page
            .test_section
            .clone()
            .unwrap_or_else(|| page.url.clone());

        let mut available = Vec::new();
        for day in parse_day_links(&html) {
            let day_url = resolve_href(&page.url, &day.href);
            let day_html = match self.client.fetch_page(&day_url).await {
                Ok(html) => html,
                Err(e) => {
                    warn!("could not fetch time slots for {}: {}", day.date, e);
                    continue;
                }
            };
            for cell in parse_time_cells(&day_html) {
                available.push(Slot::new(
                    section_label.clone(),
                    day.date,
                    cell.time,
                    resolve_href(&page.url, &cell.href),
                ));
            }
        }

        debug!(
            "page snapshot: {} held, {} available",
            held.len(),
            available.len()
        );
        Ok(SlotSnapshot { held, available })
    }
}

/// [`ReservationAgent`] over the same pages: registration and
/// unregistration are plain GETs on the token URLs, confirmed by marker
/// text in the response.
#[derive(Debug, Clone)]
pub struct MoodleReservationAgent {
    client: Arc<MoodleClient>,
}

impl MoodleReservationAgent {
    pub fn new(client: Arc<MoodleClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ReservationAgent for MoodleReservationAgent {
    async fn reserve(&self, slot: &Slot) -> Result<ReservedHold> {
        info!("registering slot {} via {}", slot, slot.reserve_token);
        let html = self.client.fetch_page(&slot.reserve_token).await?;

        if let Some(message) = first_error_box(&html) {
            // The slot filled up between observation and claim.
            debug!("registration refused: {}", message);
            return Err(SeekerError::Conflict);
        }
        if !html.to_lowercase().contains(RESERVED_MARKER) {
            return Err(SeekerError::parse(
                "registration response carries neither confirmation nor error",
            ));
        }

        // The confirmation page lists the reservation with its unregister
        // link; match by appointment moment, the section headings on
        // target pages are not always known in advance.
        let reserved = parse_reserved_slots(&html, None, Utc::now().date_naive())
            .into_iter()
            .find(|cell| cell.date == slot.date && cell.time == slot.time)
            .ok_or_else(|| {
                SeekerError::parse("confirmed reservation not found in reserved-slot table")
            })?;

        Ok(ReservedHold {
            release_token: resolve_href(&slot.reserve_token, &reserved.unregister_href),
            release_deadline: reserved.deadline,
        })
    }

    async fn release(&self, release_token: &str) -> Result<()> {
        info!("unregistering slot via {}", release_token);
        let html = self.client.fetch_page(release_token).await?;

        if let Some(message) = first_error_box(&html) {
            let lowered = message.to_lowercase();
            if lowered.contains("pozdě") || lowered.contains("lhůt") {
                return Err(SeekerError::DeadlinePassed);
            }
            return Err(SeekerError::remote(format!(
                "unregistration refused: {message}"
            )));
        }

        if html.to_lowercase().contains(RELEASED_MARKER) {
            debug!("unregistration confirmed by marker");
        } else {
            // No marker and no error box: the page redirected back to the
            // overview. Treat as released; the next snapshot re-verifies.
            debug!("unregistration response had no marker, assuming released");
        }
        Ok(())
    }
}

// ===== pure parsing helpers =====

#[derive(Debug, Clone, PartialEq, Eq)]
struct DayLink {
    date: NaiveDate,
    href: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TimeCell {
    time: NaiveTime,
    href: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ReservedCell {
    section: String,
    date: NaiveDate,
    time: NaiveTime,
    unregister_href: String,
    deadline: Option<DateTime<Utc>>,
}

impl ReservedCell {
    fn into_slot(self, page_url: &str) -> Slot {
        let mut slot = Slot::new(self.section, self.date, self.time, "");
        slot.release_token = Some(resolve_href(page_url, &self.unregister_href));
        slot.release_deadline = self.deadline;
        slot
    }
}

fn extract_login_token(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    document
        .select(&sel("input[name=logintoken]"))
        .next()
        .and_then(|input| input.value().attr("value"))
        .map(|v| v.to_string())
}

/// Calendar cells linking to per-day slot listings.
fn parse_day_links(html: &str) -> Vec<DayLink> {
    let document = Html::parse_document(html);
    let mut days = Vec::new();
    for link in document.select(&sel("td.alert-success a")) {
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        let Some(day) = query_param(href, "day") else {
            continue;
        };
        match NaiveDate::parse_from_str(&day, "%Y-%m-%d") {
            Ok(date) => days.push(DayLink {
                date,
                href: href.to_string(),
            }),
            Err(_) => warn!("unparseable day parameter '{}'", day),
        }
    }
    days
}

/// Registration links on a per-day page. Link text starts with the slot
/// time, e.g. "15:50 - rezervovat".
fn parse_time_cells(html: &str) -> Vec<TimeCell> {
    let document = Html::parse_document(html);
    let mut cells = Vec::new();
    for link in document.select(&sel("td.alert-success a")) {
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        if query_param(href, "slot").is_none() {
            continue;
        }
        let text: String = link.text().collect();
        let prefix: String = text
            .trim()
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == ':')
            .collect();
        match NaiveTime::parse_from_str(&prefix, "%H:%M") {
            Ok(time) => cells.push(TimeCell {
                time,
                href: href.to_string(),
            }),
            Err(_) => warn!("unparseable slot time in '{}'", text.trim()),
        }
    }
    cells
}

/// Reserved-slot rows, optionally narrowed to one test section.
///
/// The page interleaves `h3` section headings, an `h4` "Vaše rezervované
/// termíny" marker, and the table itself; walking those in document order
/// is simpler and more robust than sibling traversal.
///
/// Rows dated before `today` are skipped. The page keeps listing
/// appointments that already happened; counting one as a live hold would
/// stop the search for good.
fn parse_reserved_slots(html: &str, section: Option<&str>, today: NaiveDate) -> Vec<ReservedCell> {
    let document = Html::parse_document(html);
    let mut cells = Vec::new();
    let mut current_section = String::new();
    let mut armed = false;

    for element in document.select(&sel("h3, h4, table")) {
        match element.value().name() {
            "h3" => {
                current_section = section_name(&element);
                armed = false;
            }
            "h4" => {
                let text: String = element.text().collect::<String>().to_lowercase();
                armed = text.contains("rezervované termíny");
            }
            "table" if armed => {
                armed = false;
                if let Some(wanted) = section {
                    if !current_section.contains(wanted) && !wanted.contains(&current_section) {
                        continue;
                    }
                }
                for row in element.select(&sel("tr")).skip(1) {
                    if let Some(cell) = parse_reserved_row(&row, &current_section) {
                        if cell.date < today {
                            debug!("skipping past reserved slot from {}", cell.date);
                            continue;
                        }
                        cells.push(cell);
                    }
                }
            }
            _ => {}
        }
    }
    cells
}

fn section_name(header: &ElementRef<'_>) -> String {
    // Headings read "Test: <a>Name</a>"; fall back to the whole text.
    match header.select(&sel("a")).next() {
        Some(link) => link.text().collect::<String>().trim().to_string(),
        None => header.text().collect::<String>().trim().to_string(),
    }
}

fn parse_reserved_row(row: &ElementRef<'_>, section: &str) -> Option<ReservedCell> {
    let cells: Vec<ElementRef<'_>> = row.select(&sel("td")).collect();
    if cells.len() < 5 {
        return None;
    }

    let date_text: String = cells[1].text().collect::<String>().trim().to_string();
    let date = match NaiveDate::parse_from_str(&date_text, "%d.%m.%Y") {
        Ok(date) => date,
        Err(_) => {
            warn!("unparseable reserved-slot date '{}'", date_text);
            return None;
        }
    };

    let time_text: String = cells[2].text().collect::<String>().trim().to_string();
    let time = NaiveTime::parse_from_str(&time_text, "%H:%M").ok()?;

    let unregister_href = cells[4]
        .select(&sel("a"))
        .next()
        .and_then(|a| a.value().attr("href"))?
        .to_string();

    let deadline_text: String = cells[4].text().collect();
    let deadline = parse_release_deadline(&deadline_text, date);

    Some(ReservedCell {
        section: section.to_string(),
        date,
        time,
        unregister_href,
        deadline,
    })
}

/// Parse the "(do DD.MM. HH:MM)" release deadline next to the unregister
/// link. The year is taken from the slot's date (the deadline precedes
/// the appointment); the page's timezone offset is ignored.
fn parse_release_deadline(text: &str, slot_date: NaiveDate) -> Option<DateTime<Utc>> {
    let start = text.find("(do ")? + "(do ".len();
    let rest = &text[start..];
    let end = rest.find(')')?;
    let raw = rest[..end].trim();

    let parsed = NaiveDateTime::parse_from_str(
        &format!("{}{} ", raw, slot_date.year()),
        "%d.%m. %H:%M%Y ",
    );
    match parsed {
        Ok(naive) => Some(Utc.from_utc_datetime(&naive)),
        Err(_) => {
            warn!("unparseable release deadline '{}'", raw);
            None
        }
    }
}

fn first_error_box(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    document
        .select(&sel("div.alert-danger"))
        .next()
        .map(|div| div.text().collect::<String>().trim().to_string())
}

fn query_param(href: &str, key: &str) -> Option<String> {
    let query = match href.split_once('?') {
        Some((_, q)) => q,
        None => href,
    };
    let query = query.split('#').next().unwrap_or(query);
    for pair in query.split('&') {
        if let Some((k, v)) = pair.split_once('=') {
            if k == key {
                return Some(v.to_string());
            }
        }
    }
    None
}

/// Resolve a page-relative href against the page it came from.
fn resolve_href(page_url: &str, href: &str) -> String {
    if href.starts_with("http") {
        return href.to_string();
    }
    if let Some(stripped) = href.strip_prefix('?') {
        let base = page_url.split('?').next().unwrap_or(page_url);
        return format!("{base}?{stripped}");
    }
    if href.starts_with('/') {
        if let Some(scheme_end) = page_url.find("://") {
            let host_end = page_url[scheme_end + 3..]
                .find('/')
                .map(|i| scheme_end + 3 + i)
                .unwrap_or(page_url.len());
            return format!("{}{}", &page_url[..host_end], href);
        }
    }
    href.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_URL: &str = "https://moodle.example/mod/tcb/view.php?id=776603";

    #[test]
    fn extracts_login_token() {
        let html = r#"<form><input type="hidden" name="logintoken" value="abc123"></form>"#;
        assert_eq!(extract_login_token(html).unwrap(), "abc123");
        assert!(extract_login_token("<form></form>").is_none());
    }

    #[test]
    fn parses_calendar_days() {
        let html = r#"
            <table>
              <tr>
                <td class="alert-success"><a href="?id=776603&day=2026-01-20&quiz=801703#tc">20 (456)</a></td>
                <td class="alert-danger"><a href="?id=776603&day=2026-01-21&quiz=801703#tc">21</a></td>
                <td class="alert-success"><a href="?id=776603&quiz=801703#tc">no day param</a></td>
              </tr>
            </table>
        "#;
        let days = parse_day_links(html);
        assert_eq!(days.len(), 1);
        assert_eq!(days[0].date, NaiveDate::from_ymd_opt(2026, 1, 20).unwrap());
    }

    #[test]
    fn parses_time_cells() {
        let html = r#"
            <table><tr>
              <td class="alert-success"><a href="?id=776603&quiz=801703&slot=413832#tc">15:50 - rezervovat (10)</a></td>
              <td class="alert-success"><a href="?id=776603&day=2026-01-20#tc">not a slot</a></td>
            </tr></table>
        "#;
        let cells = parse_time_cells(html);
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].time, NaiveTime::from_hms_opt(15, 50, 0).unwrap());
        assert!(cells[0].href.contains("slot=413832"));
    }

    fn reserved_page() -> &'static str {
        r##"
            <h3>Test: <a href="#">UNIX exam</a></h3>
            <h4>Vaše rezervované termíny</h4>
            <table>
              <tr><th>#</th><th>Datum</th><th>Čas</th><th>Místo</th><th></th></tr>
              <tr>
                <td>1</td><td>15.01.2026</td><td>18:20</td><td>Hall A</td>
                <td><a href="?id=776603&unregister=407275#tc">odhlásit</a> (do 15.01. 16:20)</td>
              </tr>
            </table>
            <h3>Test: <a href="#">Databases exam</a></h3>
            <h4>Vaše rezervované termíny</h4>
            <table>
              <tr><th>#</th><th>Datum</th><th>Čas</th><th>Místo</th><th></th></tr>
              <tr>
                <td>1</td><td>20.01.2026</td><td>10:00</td><td>Hall B</td>
                <td><a href="?id=776603&unregister=407300#tc">odhlásit</a></td>
              </tr>
            </table>
        "##
    }

    fn fixture_today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 1).unwrap()
    }

    #[test]
    fn parses_reserved_rows_per_section() {
        let cells = parse_reserved_slots(reserved_page(), Some("UNIX exam"), fixture_today());
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].date, NaiveDate::from_ymd_opt(2026, 1, 15).unwrap());
        assert_eq!(cells[0].time, NaiveTime::from_hms_opt(18, 20, 0).unwrap());
        assert!(cells[0].unregister_href.contains("unregister=407275"));
        let deadline = cells[0].deadline.unwrap();
        assert_eq!(
            deadline,
            Utc.from_utc_datetime(
                &NaiveDate::from_ymd_opt(2026, 1, 15)
                    .unwrap()
                    .and_hms_opt(16, 20, 0)
                    .unwrap()
            )
        );
    }

    #[test]
    fn parses_all_sections_when_unnarrowed() {
        let cells = parse_reserved_slots(reserved_page(), None, fixture_today());
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[1].section, "Databases exam");
        assert!(cells[1].deadline.is_none());
    }

    #[test]
    fn skips_reserved_rows_dated_before_today() {
        let html = r##"
            <h3>Test: <a href="#">UNIX exam</a></h3>
            <h4>Vaše rezervované termíny</h4>
            <table>
              <tr><th>#</th><th>Datum</th><th>Čas</th><th>Místo</th><th></th></tr>
              <tr>
                <td>1</td><td>15.01.2020</td><td>18:20</td><td>Hall A</td>
                <td><a href="?id=776603&unregister=1#tc">odhlásit</a></td>
              </tr>
              <tr>
                <td>2</td><td>15.01.2026</td><td>10:00</td><td>Hall A</td>
                <td><a href="?id=776603&unregister=2#tc">odhlásit</a></td>
              </tr>
            </table>
        "##;
        let cells = parse_reserved_slots(html, None, fixture_today());
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].date, NaiveDate::from_ymd_opt(2026, 1, 15).unwrap());
    }

    #[test]
    fn finds_error_boxes() {
        let html = r#"<div class="alert alert-danger">Termín je obsazen</div>"#;
        assert_eq!(first_error_box(html).unwrap(), "Termín je obsazen");
        assert!(first_error_box("<div class=\"alert\">ok</div>").is_none());
    }

    #[test]
    fn resolves_hrefs() {
        assert_eq!(
            resolve_href(PAGE_URL, "?id=776603&slot=1#tc"),
            "https://moodle.example/mod/tcb/view.php?id=776603&slot=1#tc"
        );
        assert_eq!(
            resolve_href(PAGE_URL, "/mod/tcb/view.php?id=9"),
            "https://moodle.example/mod/tcb/view.php?id=9"
        );
        assert_eq!(resolve_href(PAGE_URL, "https://x.example/y"), "https://x.example/y");
    }

    #[test]
    fn query_param_handles_fragments() {
        assert_eq!(
            query_param("?id=776603&day=2026-01-20#tc", "day").unwrap(),
            "2026-01-20"
        );
        assert!(query_param("?id=776603#tc", "day").is_none());
    }
}
