//! JUnit XML export of one plan.
//!
//! Each plan becomes one `<testsuite>`; each record one `<testcase>`:
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites name="nightly" tests="3" failures="1" errors="1" skipped="0" time="42.000">
//!   <testsuite name="nightly" tests="3" failures="1" errors="1" skipped="0" time="42.000">
//!     <testcase classname="nightly" name="gpio-irq" time="12.000"/>
//!     <testcase classname="nightly" name="spi-loopback" time="20.000">
//!       <failure message="script exited with code 1" type="execution failure"/>
//!     </testcase>
//!     <testcase classname="nightly" name="boot" time="10.000">
//!       <error message="exceeded the 600s timeout" type="timeout exceeded"/>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```
//!
//! Script failures are `<failure>`; timeouts, lost environments and other
//! infrastructure problems are `<error>`; cancelled and never-run records
//! are `<skipped>`.

use std::path::{Path, PathBuf};

use anyhow::Context;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use crate::model::{ExecutionPlan, ExecutionRecord, FailureKind, RecordState};
use crate::store::persist::escape_id;

#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct Totals {
    tests: usize,
    failures: usize,
    errors: usize,
    skipped: usize,
    time: f64,
}

fn totals(records: &[ExecutionRecord]) -> Totals {
    let mut t = Totals {
        tests: records.len(),
        ..Default::default()
    };
    for record in records {
        match classify(record) {
            Verdict::Passed => {}
            Verdict::Failure => t.failures += 1,
            Verdict::Error => t.errors += 1,
            Verdict::Skipped => t.skipped += 1,
        }
        t.time += duration_secs(record);
    }
    t
}

enum Verdict {
    Passed,
    Failure,
    Error,
    Skipped,
}

fn classify(record: &ExecutionRecord) -> Verdict {
    match record.state {
        RecordState::Completed => Verdict::Passed,
        RecordState::Failed => match record.failure.as_ref().map(|f| f.kind) {
            Some(FailureKind::ExecutionFailure) if record.exit_code.is_some() => Verdict::Failure,
            _ => Verdict::Error,
        },
        RecordState::TimedOut => Verdict::Error,
        RecordState::Cancelled
        | RecordState::Queued
        | RecordState::EnvironmentPending
        | RecordState::Running => Verdict::Skipped,
    }
}

fn duration_secs(record: &ExecutionRecord) -> f64 {
    match (record.started_at, record.finished_at) {
        (Some(start), Some(end)) => (end - start)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0),
        _ => 0.0,
    }
}

fn suite_start<'a>(tag: &'a str, name: &'a str, t: &Totals) -> BytesStart<'a> {
    let mut start = BytesStart::new(tag);
    start.push_attribute(("name", name));
    start.push_attribute(("tests", t.tests.to_string().as_str()));
    start.push_attribute(("failures", t.failures.to_string().as_str()));
    start.push_attribute(("errors", t.errors.to_string().as_str()));
    start.push_attribute(("skipped", t.skipped.to_string().as_str()));
    start.push_attribute(("time", format!("{:.3}", t.time).as_str()));
    start
}

/// Renders the records of `plan` as a JUnit document.
pub fn junit_xml(plan: &ExecutionPlan, records: &[ExecutionRecord]) -> anyhow::Result<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let name = plan.test_plan_name.as_deref().unwrap_or(&plan.id);
    let t = totals(records);
    writer.write_event(Event::Start(suite_start("testsuites", name, &t)))?;

    let mut suite = suite_start("testsuite", name, &t);
    if let Some(started) = plan.started_at {
        suite.push_attribute(("timestamp", started.to_rfc3339().as_str()));
    }
    writer.write_event(Event::Start(suite))?;

    for record in records {
        write_testcase(&mut writer, &plan.id, record)?;
    }

    writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
    writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

    Ok(String::from_utf8(writer.into_inner())?)
}

fn write_testcase<W: std::io::Write>(
    writer: &mut Writer<W>,
    classname: &str,
    record: &ExecutionRecord,
) -> anyhow::Result<()> {
    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", classname));
    testcase.push_attribute(("name", record.test_case_id.as_str()));
    testcase.push_attribute(("time", format!("{:.3}", duration_secs(record)).as_str()));

    let verdict = classify(record);
    let has_output = !record.artifacts.stdout.is_empty() || !record.artifacts.stderr.is_empty();
    if matches!(verdict, Verdict::Passed) && !has_output {
        writer.write_event(Event::Empty(testcase))?;
        return Ok(());
    }
    writer.write_event(Event::Start(testcase))?;

    let (tag, kind, message) = match (&verdict, &record.failure) {
        (Verdict::Passed, _) => ("", String::new(), String::new()),
        (Verdict::Skipped, Some(failure)) => ("skipped", String::new(), failure.reason.clone()),
        (Verdict::Skipped, None) => ("skipped", String::new(), format!("not run ({})", record.state)),
        (Verdict::Failure | Verdict::Error, Some(failure)) => (
            if matches!(verdict, Verdict::Failure) {
                "failure"
            } else {
                "error"
            },
            failure.kind.to_string(),
            failure.reason.clone(),
        ),
        (Verdict::Failure | Verdict::Error, None) => {
            ("error", record.state.to_string(), record.state.to_string())
        }
    };
    if !tag.is_empty() {
        let mut element = BytesStart::new(tag);
        element.push_attribute(("message", message.as_str()));
        if !kind.is_empty() {
            element.push_attribute(("type", kind.as_str()));
        }
        writer.write_event(Event::Empty(element))?;
    }

    for (tag, text) in [
        ("system-out", &record.artifacts.stdout),
        ("system-err", &record.artifacts.stderr),
    ] {
        if text.is_empty() {
            continue;
        }
        writer.write_event(Event::Start(BytesStart::new(tag)))?;
        writer.write_event(Event::Text(BytesText::new(text)))?;
        writer.write_event(Event::End(BytesEnd::new(tag)))?;
    }

    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    Ok(())
}

/// Writes `{dir}/{plan}.xml`, creating `dir` if needed.
pub fn write_junit(
    dir: &Path,
    plan: &ExecutionPlan,
    records: &[ExecutionRecord],
) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create report directory: {}", dir.display()))?;
    let path = dir.join(format!("{}.xml", escape_id(&plan.id)));
    let xml = junit_xml(plan, records)?;
    std::fs::write(&path, xml)
        .with_context(|| format!("Failed to write JUnit report: {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::model::{Artifacts, Failure};
    use crate::store::persist::MemoryPersistence;
    use crate::store::tests::case;
    use crate::store::{PlanStore, PlanSubmission, RecordFilter, TerminalUpdate};

    fn finished_plan() -> (ExecutionPlan, Vec<ExecutionRecord>) {
        let store = PlanStore::open(Arc::new(MemoryPersistence::new())).unwrap();
        let cases = ["boot", "gpio", "spi", "usb"]
            .iter()
            .map(|id| case(id, ""))
            .collect();
        store
            .submit(PlanSubmission::new("p", cases, 1).with_name("nightly"))
            .unwrap();
        store.expand("p").unwrap();
        for (rid, env) in [("p/boot", "env-1"), ("p/gpio", "env-2"), ("p/spi", "env-3")] {
            store.mark_dispatched(rid, &env.to_string()).unwrap();
            store.mark_running(rid).unwrap();
        }

        let artifacts = Artifacts {
            stdout: "Linux version 6.6 <arm64>\n".to_string(),
            ..Default::default()
        };
        store
            .mark_terminal("p/boot", TerminalUpdate::completed(0, artifacts))
            .unwrap();
        store
            .mark_terminal(
                "p/gpio",
                TerminalUpdate::failed(Failure::new(
                    FailureKind::ExecutionFailure,
                    "script exited with code 1",
                ))
                .with_exit_code(Some(1)),
            )
            .unwrap();
        store
            .mark_terminal(
                "p/spi",
                TerminalUpdate::timed_out(Failure::new(
                    FailureKind::TimeoutExceeded,
                    "exceeded the 600s timeout",
                )),
            )
            .unwrap();
        store.request_cancel("p").unwrap();
        store.refresh_plan_status("p").unwrap();

        let plan = store.get_plan("p").unwrap();
        let records = store.list(&RecordFilter::plan("p"));
        (plan, records)
    }

    #[test]
    fn test_junit_classifies_records() {
        let (plan, records) = finished_plan();
        let xml = junit_xml(&plan, &records).unwrap();

        assert!(xml.contains(r#"<testsuite name="nightly" tests="4" failures="1" errors="1" skipped="1""#));
        assert!(xml.contains(r#"<failure message="script exited with code 1" type="execution failure"/>"#));
        assert!(xml.contains(r#"<error message="exceeded the 600s timeout" type="timeout exceeded"/>"#));
        assert!(xml.contains("<skipped message="));
        // Output text is escaped.
        assert!(xml.contains("Linux version 6.6 &lt;arm64&gt;"));
    }

    #[test]
    fn test_write_junit_creates_directory() {
        let (plan, records) = finished_plan();
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("reports");

        let path = write_junit(&out, &plan, &records).unwrap();
        assert_eq!(path, out.join("p.xml"));
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.starts_with("<?xml"));
    }
}
