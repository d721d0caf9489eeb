//! User and chat history commands.

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use parlor_core::repository::{ChatRepository, UserRepository};
use parlor_types::chat::UserId;

use crate::state::AppState;

/// List all users in a table.
pub async fn list_users(state: &AppState, json: bool) -> Result<()> {
    let users = state.users.all().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&users)?);
        return Ok(());
    }

    if users.is_empty() {
        println!();
        println!("  No users yet.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec![
        Cell::new("Id").fg(Color::White),
        Cell::new("Name").fg(Color::White),
        Cell::new("Telegram").fg(Color::White),
        Cell::new("Admin").fg(Color::White),
        Cell::new("Since").fg(Color::White),
    ]);

    for user in &users {
        let telegram = match (&user.telegram_username, user.telegram_user_id) {
            (Some(name), _) => name.clone(),
            (None, Some(id)) => id.to_string(),
            (None, None) => "-".to_string(),
        };
        table.add_row(vec![
            Cell::new(user.id),
            Cell::new(&user.name).fg(Color::Cyan),
            Cell::new(telegram),
            Cell::new(if user.is_admin { "yes" } else { "" }).fg(Color::Yellow),
            Cell::new(user.created_at.format("%Y-%m-%d").to_string()).fg(Color::DarkGrey),
        ]);
    }

    println!("{table}");
    Ok(())
}

/// Print a user's chat history, oldest exchange first.
pub async fn show_history(
    state: &AppState,
    user_id: UserId,
    limit: Option<u32>,
    json: bool,
) -> Result<()> {
    let user = state
        .users
        .get(user_id)
        .await
        .with_context(|| format!("User {user_id} not found"))?;
    let limit = limit.unwrap_or(state.settings.history_window);
    let history = state.chat.get_history(user.id, limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&history)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} History of {} ({} of at most {})",
        style("💬").bold(),
        style(&user.name).cyan(),
        history.len(),
        limit
    );
    println!();
    for entry in &history {
        println!("  {} {}", style("Q:").bold(), entry.question);
        println!("  {} {}", style("A:").green().bold(), entry.answer);
        println!();
    }
    Ok(())
}
