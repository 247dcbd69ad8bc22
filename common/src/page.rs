use core::fmt::Write as _;

use chrono::{DateTime, FixedOffset};

use crate::{
    form::Notice,
    schedule::{Schedule, MAX_DURATION_HOURS, MIN_DURATION_HOURS},
    types::{CellState, ControlState, Override, StatusLine},
};

#[derive(Debug, Clone)]
pub struct PageView {
    pub schedule: Schedule,
    pub control: ControlState,
    pub upgrading: bool,
    pub notice: Option<Notice>,
    pub now: Option<DateTime<FixedOffset>>,
}

const OVERRIDE_CHOICES: [(Override, &str); 3] = [
    (Override::None, "Schedule"),
    (Override::ForceOn, "Force on"),
    (Override::ForceOff, "Force off"),
];

const COMMAND_CHOICES: [(&str, &str); 4] = [
    ("none", "None"),
    ("upgrade", "Upgrade"),
    ("reboot", "Reboot"),
    ("reset", "Reset"),
];

pub fn render_page(view: &PageView, log_lines: &[String]) -> String {
    let mut html = String::with_capacity(2048);
    html.push_str("<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>Pool</title></head>\n<body>\n");
    html.push_str("<h2>Pool Saltwater System</h2>\n");

    if let Some(notice) = view.notice {
        let _ = writeln!(html, "<p><b>{}</b></p>", notice.as_str());
    }

    render_form(&mut html, &view.schedule);
    render_status(&mut html, view);

    html.push_str("<h3>Log</h3>\n<a href=\"/?log=all\">Show full log</a>\n<pre>\n");
    for line in log_lines {
        html.push_str(&escape_html(line));
        html.push('\n');
    }
    html.push_str("</pre>\n</body>\n</html>\n");
    html
}

fn render_form(html: &mut String, schedule: &Schedule) {
    html.push_str("<form action=\"/\" method=\"post\">\n");
    let _ = writeln!(
        html,
        "  <label for=\"stime\">Start time:</label><br>\n  \
         <input type=\"time\" id=\"stime\" name=\"stime\" value=\"{}\"><br>",
        schedule.start()
    );
    let _ = writeln!(
        html,
        "  <label for=\"duration\">Duration: {hours} h</label><br>\n  \
         <input type=\"range\" id=\"duration\" name=\"duration\" min=\"{MIN_DURATION_HOURS}\" \
         max=\"{MAX_DURATION_HOURS}\" value=\"{hours}\"><br>",
        hours = schedule.duration_hours()
    );

    html.push_str("  <p>Override:</p>\n");
    for (mode, label) in OVERRIDE_CHOICES {
        radio(
            html,
            "force",
            mode.form_value(),
            label,
            mode == schedule.override_mode(),
        );
    }

    html.push_str("  <p>Command:</p>\n");
    for (value, label) in COMMAND_CHOICES {
        radio(html, "command", value, label, value == "none");
    }

    html.push_str("  <input type=\"submit\" value=\"Ok\">\n</form>\n");
}

fn radio(html: &mut String, name: &str, value: &str, label: &str, checked: bool) {
    let id = format!("{name}_{value}");
    let _ = writeln!(
        html,
        "  <input type=\"radio\" id=\"{id}\" name=\"{name}\" value=\"{value}\"{}>\
         <label for=\"{id}\">{label}</label><br>",
        if checked { " checked" } else { "" }
    );
}

fn render_status(html: &mut String, view: &PageView) {
    let status = StatusLine::from_state(&view.control, view.upgrading);
    let _ = writeln!(html, "<p>Status: {}</p>", status.as_str());

    let flow = match view.control.cell_state() {
        CellState::Idle => None,
        CellState::ActiveFlowOk => Some("ok"),
        CellState::ActiveLowFlow => Some("low"),
    };
    if let Some(flow) = flow {
        let _ = writeln!(
            html,
            "<p>Flow: {flow}, polarity {}, reversals {}</p>",
            u8::from(view.control.polarity),
            view.control.cycle_count
        );
    }

    let Some(now) = view.now else {
        html.push_str("<p>Clock not set</p>\n");
        return;
    };
    match view.schedule.override_mode() {
        Override::ForceOn => html.push_str("<p>Forced on</p>\n"),
        Override::ForceOff => html.push_str("<p>Forced off</p>\n"),
        Override::None => {
            if let Some(end) = view.schedule.window_end(now) {
                let _ = writeln!(html, "<p>Active until {}</p>", end.format("%H:%M"));
            } else if let Some(start) = view.schedule.next_start(now) {
                let _ = writeln!(html, "<p>Next start {}</p>", start.format("%H:%M"));
            }
        }
    }
}

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::TimeOfDay;
    use chrono::TimeZone;

    fn view() -> PageView {
        PageView {
            schedule: Schedule::new(TimeOfDay::new(8, 0).unwrap(), 3).unwrap(),
            control: ControlState::default(),
            upgrading: false,
            notice: None,
            now: Some(
                FixedOffset::east_opt(3600)
                    .unwrap()
                    .with_ymd_and_hms(2026, 8, 1, 9, 0, 0)
                    .unwrap(),
            ),
        }
    }

    #[test]
    fn renders_current_settings() {
        let html = render_page(&view(), &[]);

        assert!(html.contains("<h2>Pool Saltwater System</h2>"));
        assert!(html.contains("value=\"08:00\""));
        assert!(html.contains("max=\"8\" value=\"3\""));
        assert!(html.contains("id=\"force_none\" name=\"force\" value=\"none\" checked"));
        assert!(html.contains("Status: Sleeping"));
        assert!(html.contains("Active until 11:00"));
    }

    #[test]
    fn status_line_follows_state() {
        let mut page = view();
        page.control.running = true;
        page.control.flow_ok = true;
        assert!(render_page(&page, &[]).contains("Status: Running"));

        page.upgrading = true;
        assert!(render_page(&page, &[]).contains("Status: Upgrading..."));
    }

    #[test]
    fn shows_notice_and_escaped_log_lines() {
        let mut page = view();
        page.notice = Some(Notice::Rebooting);

        let html = render_page(&page, &["a <b> & c".to_string(), "second".to_string()]);

        assert!(html.contains("<b>Rebooting...</b>"));
        assert!(html.contains("a &lt;b&gt; &amp; c\nsecond\n"));
        assert!(html.contains("<a href=\"/?log=all\">Show full log</a>"));
    }

    #[test]
    fn override_radio_reflects_schedule() {
        let mut page = view();
        page.schedule.set_override(Override::ForceOff);

        let html = render_page(&page, &[]);

        assert!(html.contains("value=\"off\" checked"));
        assert!(!html.contains("value=\"none\" checked><label for=\"force_none\""));
        assert!(html.contains("Forced off"));
    }
}
