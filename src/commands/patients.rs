//! `patients` command: list patients by section

use colored::Colorize;
use prettytable::{row, Table};
use tokio::sync::mpsc;

use crate::error::{Result, SmartError};
use crate::patients::{PatientList, PatientListOrder, PatientListQuery, StatusEvent};

use super::ClientContext;

/// Options of the `patients` command.
#[derive(Debug, Clone)]
pub struct PatientsArgs {
    pub order: Option<String>,
    pub page_size: Option<u32>,
    pub pages: usize,
    pub json: bool,
}

/// Fetches up to `pages` pages and prints the sectioned list.
pub async fn list_patients(ctx: &ClientContext, args: PatientsArgs) -> Result<()> {
    ctx.ensure_authorized().await?;

    let order: PatientListOrder = match args.order {
        Some(ref order) => order.parse()?,
        None => ctx.config.patient_order()?,
    };
    let page_size = args.page_size.unwrap_or(ctx.config.patients.page_size);
    let query = PatientListQuery::all(order).with_page_size(page_size);

    let list = PatientList::new(ctx.signed_gateway(), query);
    let mut events = list.subscribe();

    list.retrieve().await;
    check_events(&mut events)?;
    for _ in 1..args.pages.max(1) {
        if !list.has_more() {
            break;
        }
        list.retrieve_more().await;
        check_events(&mut events)?;
    }

    if args.json {
        let resources: Vec<_> = list
            .patients()
            .into_iter()
            .map(|p| p.into_resource())
            .collect();
        let rendered = serde_json::to_string_pretty(&resources).map_err(SmartError::Serialization)?;
        println!("{}", rendered);
        return Ok(());
    }

    print_sections(&list);
    Ok(())
}

/// Drains status events, failing on the first reported error.
fn check_events(events: &mut mpsc::UnboundedReceiver<StatusEvent>) -> Result<()> {
    while let Ok(event) = events.try_recv() {
        if let Some(error) = event.error {
            return Err(anyhow::anyhow!("{:#}", error));
        }
    }
    Ok(())
}

fn print_sections(list: &PatientList) {
    let patients = list.patients();
    println!(
        "\n{} of {} patients, ordered by {}\n",
        list.actual_count(),
        list.expected_count(),
        list.order()
    );

    for section in list.sections() {
        if section.placeholder {
            println!(
                "{} {}",
                section.title.dimmed(),
                format!("{} more not loaded", section.len).dimmed()
            );
            continue;
        }

        println!("{}", section.title.bold().cyan());
        let mut table = Table::new();
        for patient in &patients[section.offset..section.offset + section.len] {
            table.add_row(row![
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
    println!();
}
