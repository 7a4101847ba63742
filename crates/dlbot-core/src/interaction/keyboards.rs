use crate::{
    formatting::format_file_size,
    media::QualityOption,
    messaging::{InlineButton, InlineKeyboard},
    security::{Permission, Role},
};

fn cancel_row() -> Vec<InlineButton> {
    vec![InlineButton::new("❌ Cancel", "cancel")]
}

pub fn quality(options: &[QualityOption]) -> InlineKeyboard {
    let mut buttons: Vec<InlineButton> = options
        .iter()
        .map(|q| {
            let label = if q.size > 0 {
                format!("{} - {}", q.label, format_file_size(q.size))
            } else {
                q.label.clone()
            };
            InlineButton::new(label, format!("quality:{}", q.label))
        })
        .collect();
    if buttons.is_empty() {
        buttons.push(InlineButton::new("Best available", "quality:best"));
    }
    InlineKeyboard::column(buttons).row(cancel_row())
}

pub fn delivery_format() -> InlineKeyboard {
    InlineKeyboard::default()
        .row(vec![
            InlineButton::new("📁 File", "format:file"),
            InlineButton::new("🔗 Link", "format:link"),
        ])
        .row(cancel_row())
}

/// Only the sections `role` may open.
pub fn admin_panel(role: Role) -> InlineKeyboard {
    let candidates = [
        (Permission::Stats, "📊 Statistics", "admin:stats"),
        (Permission::Broadcast, "📢 Broadcast", "admin:broadcast"),
        (Permission::ManageUsers, "👥 Users", "admin:users"),
        (Permission::Ban, "🚫 Banned users", "admin:banned"),
        (Permission::ViewLogs, "📝 Logs", "admin:logs"),
        (Permission::Ban, "⛔ Ban user", "admin:ban"),
        (Permission::Unban, "✅ Unban user", "admin:unban"),
    ];
    let buttons = candidates
        .into_iter()
        .filter(|(p, _, _)| role.allows(*p))
        .map(|(_, label, data)| InlineButton::new(label, data))
        .collect::<Vec<_>>();

    let mut kb = InlineKeyboard::default();
    for pair in buttons.chunks(2) {
        kb = kb.row(pair.to_vec());
    }
    kb
}

pub fn broadcast_mode() -> InlineKeyboard {
    InlineKeyboard::default()
        .row(vec![
            InlineButton::new("📢 Send now", "broadcast:now"),
            InlineButton::new("🗓 Schedule", "broadcast:schedule"),
        ])
        .row(cancel_row())
}

pub fn user_management() -> InlineKeyboard {
    InlineKeyboard::default()
        .row(vec![
            InlineButton::new("👑 Make admin", "role:admin"),
            InlineButton::new("🛡 Make moderator", "role:moderator"),
        ])
        .row(vec![InlineButton::new("👤 Make user", "role:user")])
        .row(vec![
            InlineButton::new("⛔ Ban", "admin:ban"),
            InlineButton::new("✅ Unban", "admin:unban"),
        ])
}

pub fn history() -> InlineKeyboard {
    InlineKeyboard::default().row(vec![InlineButton::new("🗑 Clear history", "history:clear")])
}

pub fn cancel_only() -> InlineKeyboard {
    InlineKeyboard::default().row(cancel_row())
}
