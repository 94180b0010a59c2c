use std::path::Path;

use wildwatch_core::forms::parse_form;
use wildwatch_core::kobo::FormGateway;
use wildwatch_core::models::FormDefinition;
use wildwatch_core::util::now_millis;

use crate::commands::common::{format_form_lines, open_database, open_sync_context};
use crate::error::CliError;

pub async fn run_forms(refresh: bool, as_json: bool, db_path: Option<&Path>) -> Result<(), CliError> {
    let forms = if refresh {
        refresh_forms(db_path).await?
    } else {
        open_database(db_path).await?.list_forms().await?
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&forms)?);
        return Ok(());
    }

    if forms.is_empty() {
        println!("No forms cached. Run `wildwatch forms --refresh` to fetch them from Kobo.");
        return Ok(());
    }
    for line in format_form_lines(&forms) {
        println!("{line}");
    }
    Ok(())
}

async fn refresh_forms(db_path: Option<&Path>) -> Result<Vec<FormDefinition>, CliError> {
    let context = open_sync_context(db_path).await?;
    let started = now_millis();

    for asset in context.kobo.list_forms().await? {
        let Some(uid) = asset.get("uid").and_then(|uid| uid.as_str()) else {
            continue;
        };
        match context.kobo.get_form(uid).await? {
            Some(full) => context.db.save_form(&parse_form(&full)?).await?,
            None => tracing::warn!(form_id = uid, "Form disappeared while refreshing"),
        }
    }

    let forms = context.db.list_forms().await?;
    tracing::info!(
        forms = forms.len(),
        elapsed_ms = now_millis() - started,
        "Refreshed form cache"
    );
    Ok(forms)
}
