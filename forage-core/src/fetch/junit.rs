//! JUnit failure extraction.
//!
//! CI runs publish `junit*.xml` reports; only the bodies of failing
//! `<testcase>` elements are worth indexing. The extractor concatenates
//! them into one grep-friendly text blob, one section per failed test.

use quick_xml::Reader;
use quick_xml::events::Event;

use crate::error::{Result, SearchError};

/// Whether an artifact name looks like a junit report.
pub fn is_junit_artifact(name: &str) -> bool {
    let base = name.rsplit('/').next().unwrap_or(name);
    base.starts_with("junit") && base.ends_with(".xml")
}

/// Extract `<failure>`/`<error>` bodies of failing testcases. Returns an
/// empty string when every test passed.
pub fn extract_failures(xml: &[u8]) -> Result<String> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();

    let mut out = String::new();
    let mut current_case: Option<String> = None;
    let mut failure_message: Option<String> = None;
    let mut failure_body = String::new();
    let mut in_failure = false;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|err| SearchError::Malformed(format!("junit xml: {err}")))?;
        match event {
            Event::Start(element) => match element.local_name().as_ref() {
                b"testcase" => {
                    current_case = Some(case_name(&element)?);
                }
                b"failure" | b"error" if current_case.is_some() => {
                    in_failure = true;
                    failure_body.clear();
                    failure_message = attribute(&element, "message")?;
                }
                _ => {}
            },
            Event::Empty(element) => match element.local_name().as_ref() {
                // A self-closing failure still marks the test failed; all
                // we have is its message attribute.
                b"failure" | b"error" if current_case.is_some() => {
                    let message = attribute(&element, "message")?.unwrap_or_default();
                    if let Some(case) = &current_case {
                        push_section(&mut out, case, &message);
                    }
                }
                _ => {}
            },
            Event::Text(text) => {
                if in_failure {
                    let unescaped = text
                        .unescape()
                        .map_err(|err| SearchError::Malformed(format!("junit text: {err}")))?;
                    failure_body.push_str(&unescaped);
                }
            }
            Event::CData(cdata) => {
                if in_failure {
                    failure_body.push_str(&String::from_utf8_lossy(&cdata.into_inner()));
                }
            }
            Event::End(element) => match element.local_name().as_ref() {
                b"failure" | b"error" if in_failure => {
                    in_failure = false;
                    let body = if failure_body.trim().is_empty() {
                        failure_message.clone().unwrap_or_default()
                    } else {
                        failure_body.clone()
                    };
                    if let Some(case) = &current_case {
                        push_section(&mut out, case, &body);
                    }
                }
                b"testcase" => {
                    current_case = None;
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

fn push_section(out: &mut String, case: &str, body: &str) {
    out.push_str("# ");
    out.push_str(case);
    out.push('\n');
    out.push_str(body.trim_matches('\n'));
    out.push_str("\n\n");
}

fn case_name(element: &quick_xml::events::BytesStart<'_>) -> Result<String> {
    let name = attribute(element, "name")?.unwrap_or_default();
    match attribute(element, "classname")? {
        Some(class) if !class.is_empty() => Ok(format!("{class}.{name}")),
        _ => Ok(name),
    }
}

fn attribute(
    element: &quick_xml::events::BytesStart<'_>,
    key: &str,
) -> Result<Option<String>> {
    match element
        .try_get_attribute(key)
        .map_err(|err| SearchError::Malformed(format!("junit attribute: {err}")))?
    {
        Some(attr) => {
            let value = attr
                .unescape_value()
                .map_err(|err| SearchError::Malformed(format!("junit attribute: {err}")))?;
            Ok(Some(value.into_owned()))
        }
        None => Ok(None),
    }
}
