//! Terminal output: a spinner that follows a request's log, and tables.
//!
//! Uses `indicatif` for the spinner and `console` for colors. Status colors
//! follow the usual badge convention: COMPLETED green, FAILED red, the rest
//! yellow.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use provisioner::config::StatusLabels;
use provisioner::{ProvisionRequest, RequestStatus, ResourceSlot};

/// Follows one request on the terminal.
pub struct RequestProgress {
    pb: ProgressBar,
    // Number of log lines already printed.
    printed: usize,
    labels: StatusLabels,
    green: Style,
    red: Style,
    yellow: Style,
}

impl RequestProgress {
    pub fn start(name: &str, labels: StatusLabels) -> Self {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message(format!("{}: {name}", labels.pending));
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            printed: 0,
            labels,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Print log lines not seen yet and refresh the spinner message.
    pub fn update(&mut self, request: &ProvisionRequest) {
        for line in request.log.iter().skip(self.printed) {
            self.pb.println(format!("  {} {line}", self.yellow.apply_to("›")));
        }
        self.printed = self.printed.max(request.log.len());
        self.pb.set_message(format!(
            "{}: {}",
            self.labels.label(request.status),
            request.name
        ));
    }

    /// Stop the spinner and report the terminal status.
    pub fn complete(&mut self, request: &ProvisionRequest) {
        self.update(request);
        self.pb.finish_and_clear();
        match request.status {
            RequestStatus::Completed => println!(
                "  {} Request #{} {} at {}",
                self.green.apply_to("✓"),
                request.id,
                self.labels.label(request.status),
                request.assigned_address
            ),
            _ => println!(
                "  {} Request #{} {}: {}",
                self.red.apply_to("✗"),
                request.id,
                self.labels.label(request.status),
                request
                    .error
                    .as_ref()
                    .map_or("unknown error", |e| e.message.as_str())
            ),
        }
    }
}

fn status_style(status: RequestStatus) -> Style {
    match status {
        RequestStatus::Completed => Style::new().green().bold(),
        RequestStatus::Failed => Style::new().red().bold(),
        _ => Style::new().yellow(),
    }
}

pub fn print_record(request: &ProvisionRequest) {
    println!(
        "{}",
        serde_json::to_string_pretty(request).unwrap_or_default()
    );
}

pub fn print_requests(requests: &[ProvisionRequest], labels: &StatusLabels) {
    if requests.is_empty() {
        println!("No requests.");
        return;
    }
    for r in requests {
        let label = labels.label(r.status);
        println!(
            "#{:<5} {:<24} {:<12} {:<10} {}",
            r.id,
            r.name,
            r.template,
            status_style(r.status).apply_to(label),
            r.assigned_address
        );
    }
}

pub fn print_slots(slots: &[ResourceSlot]) {
    let busy = Style::new().red();
    let free = Style::new().green();
    for s in slots {
        let state = if s.in_use {
            busy.apply_to("in use")
        } else {
            free.apply_to("free")
        };
        let owner = s
            .request_id
            .map(|id| format!("#{id} ({})", s.owner_tag.as_deref().unwrap_or("-")))
            .unwrap_or_default();
        println!("{:<10} {:<16} {:<8} {owner}", s.name, s.address, state);
    }
}
