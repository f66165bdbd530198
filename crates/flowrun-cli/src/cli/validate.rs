//! `flowrun validate`: parse a flow file and report every validation problem.

use std::collections::HashSet;
use std::path::Path;
use std::process::ExitCode;

use anyhow::Result;
use console::style;
use flowrun_core::workflow::validate_flow;
use flowrun_infra::flow_files::load_flow_file;

use super::loader::flows_in;

pub async fn validate(file: &Path, flows: Option<&Path>, json: bool) -> Result<ExitCode> {
    let flow = load_flow_file(file).await?;

    let mut known: HashSet<String> = flows_in(flows).await?.into_iter().map(|(_, f)| f.id).collect();
    known.insert(flow.id.clone());
    let reasons = match validate_flow(&flow, &|id| known.contains(id)) {
        Ok(()) => Vec::new(),
        Err(errors) => errors.reasons,
    };

    if json {
        let out = serde_json::json!({
            "flow_id": flow.id,
            "version": flow.version,
            "valid": reasons.is_empty(),
            "reasons": reasons,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else if reasons.is_empty() {
        println!(
            "  {} {} v{} is valid ({} top-level steps)",
            style("✓").green().bold(),
            style(&flow.id).cyan(),
            flow.version,
            flow.steps.len()
        );
    } else {
        println!(
            "  {} {} v{} is invalid:",
            style("✗").red().bold(),
            style(&flow.id).cyan(),
            flow.version
        );
        for reason in &reasons {
            println!("    - {reason}");
        }
    }

    Ok(if reasons.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
