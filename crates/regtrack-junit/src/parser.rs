//! Streaming JUnit XML reader
//!
//! Artifacts can carry tens of thousands of testcases and run to several
//! megabytes; the reader walks quick-xml events and yields one normalized
//! outcome at a time without ever materializing a DOM.

use std::io::BufRead;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use regex::Regex;

use regtrack_storage::{NewTestResult, TestStatus};

use crate::error::{ArtifactParseError, ParseResult};

/// Running totals across the outcomes yielded so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeSummary {
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub error: u64,
}

impl OutcomeSummary {
    fn record(&mut self, status: TestStatus) {
        self.total = self.total.saturating_add(1);
        match status {
            TestStatus::Passed => self.passed = self.passed.saturating_add(1),
            TestStatus::Failed => self.failed = self.failed.saturating_add(1),
            TestStatus::Skipped => self.skipped = self.skipped.saturating_add(1),
            TestStatus::Error => self.error = self.error.saturating_add(1),
        }
    }
}

/// Helper to extract a string attribute from a start element
fn get_attr(e: &BytesStart, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == name)
        .and_then(|a| String::from_utf8(a.value.to_vec()).ok())
}

/// Helper to extract an f64 attribute
fn get_attr_f64(e: &BytesStart, name: &[u8]) -> Option<f64> {
    get_attr(e, name).and_then(|s| s.parse().ok())
}

/// Streaming reader over one JUnit artifact
pub struct ArtifactReader<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    summary: OutcomeSummary,
    module_regex: Regex,
}

impl<R: BufRead> ArtifactReader<R> {
    /// Create a reader over raw XML
    ///
    /// `test_root` is the path prefix under which `testcase_module` is
    /// derived from each testcase's `file` attribute; paths outside it
    /// yield no module.
    pub fn new(input: R, test_root: &str) -> Self {
        let mut reader = Reader::from_reader(input);
        reader.config_mut().trim_text(true);

        // Escaped prefix keeps regex metacharacters in the configured root
        // from widening the match.
        let pattern = format!("^{}/(?P<module>[^/]+)/", regex::escape(test_root));
        #[allow(clippy::expect_used)] // escaped literal + fixed tail always compiles
        let module_regex = Regex::new(&pattern).expect("module pattern");

        Self {
            reader,
            buf: Vec::with_capacity(4096),
            summary: OutcomeSummary::default(),
            module_regex,
        }
    }

    /// Totals over everything yielded so far
    pub const fn summary(&self) -> &OutcomeSummary {
        &self.summary
    }

    /// Derive the path-based module from a testcase file attribute
    pub fn derive_module(&self, file_path: &str) -> Option<String> {
        self.module_regex
            .captures(file_path)
            .and_then(|c| c.name("module"))
            .map(|m| m.as_str().to_string())
    }

    /// Pull the next normalized outcome, or `None` at end of document
    ///
    /// # Errors
    ///
    /// Returns `ArtifactParseError::Malformed` on broken XML with the byte
    /// offset reached; previously yielded outcomes stay valid.
    pub fn next_outcome(&mut self) -> ParseResult<Option<NewTestResult>> {
        loop {
            self.buf.clear();
            // Resolve each event into an owned step before touching self
            // again; events borrow the read buffer.
            let step = match self.reader.read_event_into(&mut self.buf) {
                Ok(Event::Start(e)) if e.name().as_ref() == b"testcase" => {
                    DocStep::Opened(e.into_owned())
                }
                Ok(Event::Empty(e)) if e.name().as_ref() == b"testcase" => {
                    DocStep::Leaf(e.into_owned())
                }
                Ok(Event::Eof) => DocStep::Eof,
                Ok(_) => DocStep::Skip,
                Err(e) => DocStep::Broken(e),
            };

            match step {
                DocStep::Opened(open) => {
                    let outcome = self.read_testcase(&open)?;
                    self.summary.record(outcome.status);
                    return Ok(Some(outcome));
                }
                DocStep::Leaf(open) => {
                    // No child tags: PASSED
                    let outcome = self.testcase_shell(&open, TestStatus::Passed, None, None);
                    self.summary.record(outcome.status);
                    return Ok(Some(outcome));
                }
                DocStep::Eof => return Ok(None),
                DocStep::Skip => {}
                DocStep::Broken(e) => {
                    let excerpt = String::from_utf8_lossy(&self.buf).chars().take(120).collect();
                    return Err(self.malformed(&e, excerpt));
                }
            }
        }
    }

    /// Read the children of an open `<testcase>` up to its end tag
    fn read_testcase(&mut self, open: &BytesStart<'static>) -> ParseResult<NewTestResult> {
        let mut status = TestStatus::Passed;
        let mut message: Option<String> = None;
        let mut trace = String::new();
        let mut in_detail = false;
        let mut child_buf = Vec::with_capacity(1024);

        loop {
            child_buf.clear();
            let step = match self.reader.read_event_into(&mut child_buf) {
                Ok(Event::Start(e)) => match map_detail_tag(e.name().as_ref()) {
                    Some(mapped) => CaseStep::DetailOpen(mapped, get_attr(&e, b"message")),
                    None => CaseStep::Skip,
                },
                Ok(Event::Empty(e)) => match map_detail_tag(e.name().as_ref()) {
                    Some(mapped) => CaseStep::DetailLeaf(mapped, get_attr(&e, b"message")),
                    None => CaseStep::Skip,
                },
                Ok(Event::Text(t)) => match t.unescape() {
                    Ok(text) => CaseStep::Text(text.into_owned()),
                    Err(_) => CaseStep::Skip,
                },
                Ok(Event::CData(t)) => {
                    CaseStep::Text(String::from_utf8_lossy(&t.into_inner()).into_owned())
                }
                Ok(Event::End(e)) => match e.name().as_ref() {
                    b"testcase" => CaseStep::CaseClosed,
                    tag if map_detail_tag(tag).is_some() => CaseStep::DetailClosed,
                    _ => CaseStep::Skip,
                },
                Ok(Event::Eof) => CaseStep::Eof,
                Ok(_) => CaseStep::Skip,
                Err(e) => CaseStep::Broken(e),
            };

            match step {
                CaseStep::DetailOpen(mapped, detail_message) => {
                    if status == TestStatus::Passed {
                        status = mapped;
                        message = detail_message;
                        in_detail = true;
                        trace.clear();
                    }
                }
                CaseStep::DetailLeaf(mapped, detail_message) => {
                    if status == TestStatus::Passed {
                        status = mapped;
                        message = detail_message;
                    }
                }
                CaseStep::Text(text) => {
                    if in_detail {
                        trace.push_str(&text);
                    }
                }
                CaseStep::DetailClosed => in_detail = false,
                CaseStep::CaseClosed => break,
                CaseStep::Eof => {
                    return Err(ArtifactParseError::Malformed {
                        offset: self.reader.buffer_position(),
                        message: "unexpected end of document inside <testcase>".to_string(),
                        excerpt: String::new(),
                    });
                }
                CaseStep::Skip => {}
                CaseStep::Broken(e) => {
                    let excerpt =
                        String::from_utf8_lossy(&child_buf).chars().take(120).collect();
                    return Err(self.malformed(&e, excerpt));
                }
            }
        }

        let stack_trace = if trace.trim().is_empty() {
            None
        } else {
            Some(trace)
        };
        Ok(self.testcase_shell(open, status, message, stack_trace))
    }

    /// Assemble the outcome from testcase attributes plus child findings
    fn testcase_shell(
        &self,
        e: &BytesStart,
        status: TestStatus,
        message: Option<String>,
        stack_trace: Option<String>,
    ) -> NewTestResult {
        let name = get_attr(e, b"name").unwrap_or_default();
        let classname = get_attr(e, b"classname").filter(|c| !c.is_empty());
        let test_name = match classname {
            Some(class) => format!("{class}.{name}"),
            None => name,
        };

        let file_path = get_attr(e, b"file");
        let testcase_module = file_path.as_deref().and_then(|p| self.derive_module(p));

        NewTestResult {
            test_name,
            file_path,
            status,
            duration_sec: get_attr_f64(e, b"time"),
            message,
            stack_trace,
            testcase_module,
            priority: None,
            bug: None,
        }
    }

    fn malformed(&self, source: &quick_xml::Error, excerpt: String) -> ArtifactParseError {
        let offset = self.reader.buffer_position();
        match source {
            quick_xml::Error::Io(io) => ArtifactParseError::Io {
                offset,
                message: io.to_string(),
            },
            other => ArtifactParseError::Malformed {
                offset,
                message: other.to_string(),
                excerpt,
            },
        }
    }
}

/// One resolved document-level event
enum DocStep {
    Opened(BytesStart<'static>),
    Leaf(BytesStart<'static>),
    Eof,
    Skip,
    Broken(quick_xml::Error),
}

/// One resolved event inside an open testcase
enum CaseStep {
    DetailOpen(TestStatus, Option<String>),
    DetailLeaf(TestStatus, Option<String>),
    Text(String),
    DetailClosed,
    CaseClosed,
    Eof,
    Skip,
    Broken(quick_xml::Error),
}

/// Child tags that override the default PASSED status
const fn map_detail_tag(tag: &[u8]) -> Option<TestStatus> {
    match tag {
        b"failure" => Some(TestStatus::Failed),
        b"error" => Some(TestStatus::Error),
        b"skipped" => Some(TestStatus::Skipped),
        _ => None,
    }
}
