//! Identity link inspection and manual repair.

use super::{format_timestamp, CommandContext, DEFAULT_ACTOR};
use crate::cli::LinkCommands;
use crate::error::{Error, Result};
use crate::model::IdentityLink;
use crate::storage::events::Event;
use colored::Colorize;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Serialize)]
struct LinkShowOutput {
    link: IdentityLink,
    history: Vec<HistoryEntry>,
}

#[derive(Serialize)]
struct LinkListOutput {
    links: Vec<IdentityLink>,
    count: usize,
}

#[derive(Serialize)]
struct HistoryEntry {
    event: String,
    actor: String,
    from: Option<String>,
    to: Option<String>,
    at: String,
}

impl From<Event> for HistoryEntry {
    fn from(event: Event) -> Self {
        Self {
            event: event.event_type.as_str().to_string(),
            actor: event.actor,
            from: event.old_value,
            to: event.new_value,
            at: format_timestamp(event.created_at),
        }
    }
}

/// Execute link commands.
///
/// # Errors
///
/// Returns `LinkNotFound` / `PatientNotFound` for unknown IDs, or a
/// database error.
pub fn execute(
    command: &LinkCommands,
    db: Option<&PathBuf>,
    config: Option<&PathBuf>,
    actor: Option<&str>,
    json: bool,
) -> Result<()> {
    let ctx = CommandContext::resolve(db, config)?;
    let mut storage = ctx.open_storage()?;
    let actor = actor.unwrap_or(DEFAULT_ACTOR);

    match command {
        LinkCommands::Show {
            subject: Some(subject),
            ..
        } => {
            let link = storage.get_link(subject)?.ok_or_else(|| Error::LinkNotFound {
                subject: subject.clone(),
            })?;
            let history: Vec<HistoryEntry> = storage
                .events_for("identity_link", subject, Some(20))?
                .into_iter()
                .map(HistoryEntry::from)
                .collect();

            if json {
                println!("{}", serde_json::to_string(&LinkShowOutput { link, history })?);
            } else {
                print_link(&link);
                for entry in &history {
                    println!(
                        "    {} {} by {} ({} -> {})",
                        entry.at.dimmed(),
                        entry.event,
                        entry.actor,
                        entry.from.as_deref().unwrap_or("-"),
                        entry.to.as_deref().unwrap_or("-")
                    );
                }
            }
        }

        LinkCommands::Show {
            subject: None,
            patient,
        } => {
            let links = storage.list_links(patient.as_deref())?;
            if json {
                let output = LinkListOutput {
                    count: links.len(),
                    links,
                };
                println!("{}", serde_json::to_string(&output)?);
            } else if links.is_empty() {
                println!("No identity links.");
            } else {
                for link in &links {
                    print_link(link);
                }
                println!("{} link(s)", links.len());
            }
        }

        LinkCommands::Set {
            subject,
            patient_id,
        } => {
            let link = storage.set_link(subject, patient_id, actor)?;
            if json {
                println!("{}", serde_json::to_string(&link)?);
            } else {
                println!("Linked subject {} to {}", subject.bold(), patient_id);
            }
        }

        LinkCommands::Remove { subject } => {
            let link = storage.remove_link(subject, actor)?;
            if json {
                println!("{}", serde_json::to_string(&link)?);
            } else {
                println!(
                    "Removed link {} -> {}; the next sync resolves it again",
                    subject.bold(),
                    link.patient_id
                );
            }
        }
    }

    Ok(())
}

fn print_link(link: &IdentityLink) {
    println!(
        "{} -> {}  [{}] {}",
        link.subject_external_id.bold(),
        link.patient_id,
        link.matched_by.as_str().cyan(),
        format_timestamp(link.linked_at).dimmed()
    );
}
