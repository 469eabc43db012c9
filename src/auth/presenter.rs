//! Login and patient-selection collaborators
//!
//! The coordinator never renders anything itself. It hands the authorize
//! URL to a [`LoginPresenter`] and, for native patient selection, asks a
//! [`PatientSelector`] to pick a patient. The shipped implementations are
//! terminal-oriented: [`BrowserLoginPresenter`] opens the system browser and
//! captures loopback redirects, and [`ConsolePatientSelector`] prints a table
//! and reads a choice from the prompt.

use std::any::Any;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use prettytable::{row, Table};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use url::Url;

use crate::error::{Result, SmartError};
use crate::gateway::RequestGateway;
use crate::patients::{Patient, PatientListOrder, PatientListQuery, PatientSearch};

use super::engine::AuthParameters;
use super::settings::AuthSettings;

/// Opaque, caller-owned value handed back to presenters (a window handle,
/// a parent view, and so on).
pub type PresentationContext = Arc<dyn Any + Send + Sync>;

/// Shows the login surface for an authorize URL.
#[async_trait::async_trait]
pub trait LoginPresenter: Send + Sync {
    /// Presents `authorize_url`.
    ///
    /// Returns the redirect URL when the presenter captured it itself, or
    /// `None` when the redirect will arrive through
    /// [`super::AuthCoordinator::handle_redirect`].
    async fn present_login(
        &self,
        authorize_url: &Url,
        embedded: bool,
        context: Option<&PresentationContext>,
    ) -> Result<Option<Url>>;
}

/// Picks one patient after authorization.
#[async_trait::async_trait]
pub trait PatientSelector: Send + Sync {
    /// Returns the chosen `Patient` resource, or `None` when the user declined.
    ///
    /// `gateway` is signed with the freshly obtained (or reused) credential.
    async fn select_patient(
        &self,
        gateway: RequestGateway,
        parameters: &AuthParameters,
    ) -> Result<Option<Value>>;
}

// ---------------------------------------------------------------------------
// BrowserLoginPresenter
// ---------------------------------------------------------------------------

/// Opens the authorize URL in the system browser.
///
/// When the `redirect_uri` of the authorize URL points at a loopback
/// address, a one-shot listener is bound on that port before the browser
/// opens and the redirect is captured directly. Otherwise the user is asked
/// to paste the URL the browser ended up on.
#[derive(Debug, Clone)]
pub struct BrowserLoginPresenter {
    open_browser: bool,
    title: Option<String>,
}

impl BrowserLoginPresenter {
    pub fn new() -> Self {
        Self {
            open_browser: true,
            title: None,
        }
    }

    /// Disables launching the browser; the URL is only printed.
    pub fn without_browser(mut self) -> Self {
        self.open_browser = false;
        self
    }

    /// A presenter titled from the `title` setting, if present.
    pub fn from_settings(settings: &AuthSettings) -> Self {
        match settings.title() {
            Some(title) => Self::new().with_title(title),
            None => Self::new(),
        }
    }

    /// Names the login surface in the prompt header.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    fn header(&self) -> String {
        match self.title.as_deref() {
            Some(title) => format!("{title}: open the following URL in your browser to authorize:"),
            None => "Open the following URL in your browser to authorize:".to_string(),
        }
    }
}

impl Default for BrowserLoginPresenter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl LoginPresenter for BrowserLoginPresenter {
    async fn present_login(
        &self,
        authorize_url: &Url,
        embedded: bool,
        _context: Option<&PresentationContext>,
    ) -> Result<Option<Url>> {
        if embedded {
            tracing::debug!("embedded login requested; falling back to the system browser");
        }

        let redirect_uri = authorize_url
            .query_pairs()
            .find(|(k, _)| k == "redirect_uri")
            .and_then(|(_, v)| Url::parse(&v).ok());
        let implicit = authorize_url
            .query_pairs()
            .any(|(k, v)| k == "response_type" && v == "token");

        // Fragments never reach the server, so implicit redirects cannot be
        // captured on the loopback listener.
        let listener = match redirect_uri.as_ref() {
            Some(uri) if is_loopback(uri) && !implicit => Some(bind_loopback(uri).await?),
            _ => None,
        };

        eprintln!("{}\n{}", self.header().bold(), authorize_url);
        if self.open_browser {
            try_open_browser(authorize_url.as_str());
        }

        let redirect = match (listener, redirect_uri) {
            (Some(listener), Some(uri)) => accept_redirect(listener, &uri).await?,
            _ => prompt_for_redirect().await?,
        };
        Ok(Some(redirect))
    }
}

fn is_loopback(uri: &Url) -> bool {
    uri.scheme() == "http" && matches!(uri.host_str(), Some("127.0.0.1" | "localhost"))
}

const BIND_ATTEMPTS: u32 = 20;
const BIND_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Binds the redirect port. A superseded session may still be releasing the
/// same port, so `AddrInUse` is retried briefly.
async fn bind_loopback(uri: &Url) -> Result<TcpListener> {
    let port = uri.port_or_known_default().unwrap_or(80);
    let host = uri.host_str().unwrap_or("127.0.0.1");
    let mut attempt = 1;
    loop {
        match TcpListener::bind((host, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == ErrorKind::AddrInUse && attempt < BIND_ATTEMPTS => {
                tracing::debug!(attempt, port, "redirect port busy, retrying");
                attempt += 1;
                tokio::time::sleep(BIND_RETRY_DELAY).await;
            }
            Err(e) => {
                return Err(SmartError::OAuth(format!(
                    "failed to bind redirect listener on {host}:{port}: {e}"
                ))
                .into())
            }
        }
    }
}

/// Opens `url` in the user's default browser. Failures are ignored; the URL
/// has already been printed.
fn try_open_browser(url: &str) {
    #[cfg(target_os = "macos")]
    {
        let _ = std::process::Command::new("open").arg(url).spawn();
    }
    #[cfg(target_os = "linux")]
    {
        let _ = std::process::Command::new("xdg-open").arg(url).spawn();
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        let _ = url;
    }
}

/// Accepts connections until one carries the OAuth callback, answering
/// each, and rebuilds the full redirect URL from its request line.
///
/// Requests for other paths, or without `code`, `error` or `state` in the
/// query (favicon fetches, browser prefetches), get a 404 and are skipped.
async fn accept_redirect(listener: TcpListener, redirect_uri: &Url) -> Result<Url> {
    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .map_err(|e| SmartError::OAuth(format!("failed to accept redirect connection: {e}")))?;
        tracing::debug!(%peer, "redirect connection accepted");

        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let mut request_line = String::new();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| SmartError::OAuth(format!("failed to read redirect request: {e}")))?
        {
            if line.is_empty() {
                break;
            }
            if request_line.is_empty() {
                request_line = line;
            }
        }

        // "GET /callback?code=...&state=... HTTP/1.1"
        let target = request_line.split_whitespace().nth(1).unwrap_or("/");
        let redirect = redirect_uri
            .join(target)
            .ok()
            .filter(|url| is_callback(url, redirect_uri));

        let response = match redirect {
            Some(_) => "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\nAuthorization received. You may close this tab.",
            None => "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        };
        if let Err(e) = write_half.write_all(response.as_bytes()).await {
            tracing::warn!(error = %e, "failed to answer redirect request");
        }

        match redirect {
            Some(url) => return Ok(url),
            None => tracing::debug!(%target, "ignoring non-callback request"),
        }
    }
}

fn is_callback(url: &Url, redirect_uri: &Url) -> bool {
    url.path() == redirect_uri.path()
        && url
            .query_pairs()
            .any(|(k, _)| matches!(k.as_ref(), "code" | "error" | "state"))
}

async fn prompt_for_redirect() -> Result<Url> {
    let line = tokio::task::spawn_blocking(|| -> Result<String> {
        let mut editor = rustyline::DefaultEditor::new()
            .map_err(|e| SmartError::Config(format!("failed to open prompt: {e}")))?;
        editor
            .readline("Paste the redirect URL: ")
            .map_err(|e| SmartError::OAuth(format!("no redirect URL entered: {e}")).into())
    })
    .await
    .map_err(|e| SmartError::OAuth(format!("prompt task failed: {e}")))??;

    Url::parse(line.trim())
        .map_err(|e| SmartError::OAuth(format!("invalid redirect URL: {e}")).into())
}

// ---------------------------------------------------------------------------
// ConsolePatientSelector
// ---------------------------------------------------------------------------

/// Lists the first page of patients and reads a row number from the prompt.
#[derive(Debug, Clone)]
pub struct ConsolePatientSelector {
    order: PatientListOrder,
    page_size: u32,
}

impl ConsolePatientSelector {
    pub fn new(order: PatientListOrder, page_size: u32) -> Self {
        Self { order, page_size }
    }
}

impl Default for ConsolePatientSelector {
    fn default() -> Self {
        Self::new(PatientListOrder::ByFamilyNameAsc, 20)
    }
}

#[async_trait::async_trait]
impl PatientSelector for ConsolePatientSelector {
    async fn select_patient(
        &self,
        gateway: RequestGateway,
        _parameters: &AuthParameters,
    ) -> Result<Option<Value>> {
        let query = PatientListQuery::all(self.order).with_page_size(self.page_size);
        let mut search = PatientSearch::new(gateway, query);
        let mut patients = search.next_page().await?.patients;
        self.order.sort(&mut patients);

        if patients.is_empty() {
            println!("{}", "No patients available.".yellow());
            return Ok(None);
        }

        print_patient_table(&patients);

        let count = patients.len();
        let choice = tokio::task::spawn_blocking(move || -> Result<Option<usize>> {
            let mut editor = rustyline::DefaultEditor::new()
                .map_err(|e| SmartError::Config(format!("failed to open prompt: {e}")))?;
            loop {
                let line = match editor.readline("Select a patient (empty to cancel): ") {
                    Ok(line) => line,
                    Err(_) => return Ok(None),
                };
                let line = line.trim();
                if line.is_empty() {
                    return Ok(None);
                }
                match line.parse::<usize>() {
                    Ok(n) if (1..=count).contains(&n) => return Ok(Some(n - 1)),
                    _ => eprintln!("{}", format!("Enter a number between 1 and {count}").red()),
                }
            }
        })
        .await
        .map_err(|e| SmartError::Config(format!("prompt task failed: {e}")))??;

        Ok(choice.map(|index| patients.swap_remove(index).into_resource()))
    }
}

/// Renders patients as a numbered table.
pub fn print_patient_table(patients: &[Patient]) {
    let mut table = Table::new();
    table.add_row(row![b->"#", b->"Name", b->"Gender", b->"Birth date", b->"ID"]);
    for (i, patient) in patients.iter().enumerate() {
        table.add_row(row![
            i + 1,
            patient.display_name(),
            patient.gender().unwrap_or("-"),
            patient
                .birth_date()
                .map(|d| d.to_string())
                .unwrap_or_else(|| "-".to_string()),
            patient.id().unwrap_or("-"),
        ]);
    }
    table.printstd();
}
