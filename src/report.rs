//! Console summary and JUnit export of finished plans.

pub mod junit;

pub use junit::{junit_xml, write_junit};

use crate::model::{ExecutionRecord, PlanStatus, RecordState};
use crate::status::PlanStatusReport;

/// Lines of output shown per failed test.
const OUTPUT_TAIL_LINES: usize = 20;

/// Prints a summary of one plan to stdout.
///
/// Failed, timed out and cancelled records are listed with their reason
/// and the tail of their output.
pub fn print_summary(report: &PlanStatusReport, records: &[ExecutionRecord]) {
    let name = report.test_plan_name.as_deref().unwrap_or(&report.plan_id);
    let timed_out = records
        .iter()
        .filter(|r| r.state == RecordState::TimedOut)
        .count();

    println!();
    println!("Plan {} ({}):", console::style(name).bold(), report.overall_status);
    println!("  Total:     {}", report.total_tests);
    println!("  Passed:    {}", console::style(report.completed_tests).green());
    println!(
        "  Failed:    {}",
        console::style(report.failed_tests - timed_out).red()
    );
    if timed_out > 0 {
        println!("  Timed out: {}", console::style(timed_out).red());
    }
    if report.cancelled_tests > 0 {
        println!("  Cancelled: {}", console::style(report.cancelled_tests).yellow());
    }
    if report.queued_tests > 0 {
        println!("  Not run:   {}", console::style(report.queued_tests).red().bold());
    }
    if let (Some(start), Some(end)) = (report.started_at, report.finished_at)
        && let Ok(elapsed) = (end - start).to_std()
    {
        println!("  Duration:  {:?}", elapsed);
    }

    println!();
    match report.overall_status {
        PlanStatus::Completed => {
            println!("{}", console::style("All tests passed!").green().bold());
            return;
        }
        PlanStatus::Cancelled => println!("{}", console::style("Plan cancelled.").yellow().bold()),
        _ if report.queued_tests > 0 => println!(
            "{}",
            console::style("Some tests never found a matching environment.")
                .red()
                .bold()
        ),
        _ => println!("{}", console::style("Some tests failed.").red().bold()),
    }

    let unsuccessful: Vec<&ExecutionRecord> = records
        .iter()
        .filter(|r| r.state != RecordState::Completed)
        .collect();
    if unsuccessful.is_empty() {
        return;
    }
    println!();
    for record in unsuccessful {
        let reason = record
            .failure
            .as_ref()
            .map(|f| f.to_string())
            .unwrap_or_else(|| record.state.to_string());
        println!("  - {} [{}]", record.test_case_id, record.state);
        println!("    {}", console::style(reason).dim());
        print_tail("stdout", &record.artifacts.stdout);
        print_tail("stderr", &record.artifacts.stderr);
    }
}

fn print_tail(label: &str, text: &str) {
    if text.is_empty() {
        return;
    }
    println!("    {}", console::style(format!("{}:", label)).dim());
    let lines: Vec<&str> = text.lines().collect();
    let skip = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
    if skip > 0 {
        println!("      ... {} lines omitted", skip);
    }
    for line in &lines[skip..] {
        println!("      {}", line);
    }
}

/// Process exit code for a finished plan: 0 only if every test passed.
pub fn exit_code(reports: &[PlanStatusReport]) -> i32 {
    if reports
        .iter()
        .all(|r| r.overall_status == PlanStatus::Completed)
    {
        0
    } else {
        1
    }
}
