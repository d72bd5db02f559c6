//! Minimal inline HTML rendering for the `/` results page.
//!
//! The full template/chart stack lives outside this service; what ships
//! here is a dependency-free page that orders result sections newest
//! first through the sortable write buffer, so byte-budget truncation
//! favors recent failures.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use forage_core::search::SortableWriter;
use forage_model::SearchQuery;

use crate::handlers::search::AssembledSearch;

pub fn landing_page() -> String {
    let mut page = String::new();
    page.push_str(PAGE_HEAD);
    page.push_str(
        "<p>Search CI failures: build-log tails, junit failure bodies, and tracker bugs.</p>\n",
    );
    page.push_str(SEARCH_FORM);
    page.push_str(PAGE_FOOT);
    page
}

pub fn results_page(query: &SearchQuery, assembled: &AssembledSearch) -> std::io::Result<String> {
    let mut page = String::new();
    page.push_str(PAGE_HEAD);
    page.push_str(SEARCH_FORM);
    let _ = writeln!(
        page,
        "<p>{} matches across {} files{}</p>",
        assembled.outcome.matches,
        assembled.outcome.files,
        if assembled.outcome.truncated {
            " (truncated by byte budget)"
        } else {
            ""
        }
    );

    // Sections accumulate into the reorder window keyed by freshness;
    // past the byte budget the page degrades to arrival order.
    let mut writer = SortableWriter::new(Vec::new(), query.max_bytes);
    for (uri, by_pattern) in &assembled.results {
        let meta = assembled.metadata.get(uri);
        let key = meta
            .map(|m| m.last_modified)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let mut section = String::new();
        let title = meta.map_or(uri.as_str(), |m| m.name.as_str());
        let _ = writeln!(
            section,
            "<section><h2><a href=\"{}\">{}</a> <small>{}</small></h2>",
            escape(uri),
            escape(title),
            key.format("%Y-%m-%d %H:%M")
        );
        for (pattern, matches) in by_pattern {
            let _ = writeln!(section, "<h3>{}</h3>", escape(pattern));
            for entry in matches {
                section.push_str("<pre>");
                for line in &entry.context {
                    let _ = writeln!(section, "{}", escape(line));
                }
                section.push_str("</pre>\n");
                if entry.more_lines > 0 {
                    let _ = writeln!(section, "<p><em>{} more lines</em></p>", entry.more_lines);
                }
            }
        }
        section.push_str("</section>\n");
        writer.write_entry(key, section.as_bytes())?;
    }
    let body = writer.finish()?;
    page.push_str(&String::from_utf8_lossy(&body));
    page.push_str(PAGE_FOOT);
    Ok(page)
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

const PAGE_HEAD: &str = "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\">\
<title>forage</title></head><body>\n<h1>forage</h1>\n";

const SEARCH_FORM: &str = "<form action=\"/\" method=\"get\">\
<input type=\"text\" name=\"search\" placeholder=\"regex\" size=\"60\">\
<select name=\"type\"><option value=\"all\">all</option>\
<option value=\"bug\">bug</option><option value=\"junit\">junit</option>\
<option value=\"build-log\">build-log</option>\
<option value=\"bug+junit\">bug+junit</option></select>\
<button type=\"submit\">Search</button></form>\n";

const PAGE_FOOT: &str = "</body></html>\n";
