use serde_json::json;

use super::{FieldMapStep, RegistryError, StepRegistry};

/// The application's legacy reshaping steps in dependency order: later
/// steps reference ids produced by earlier ones (posts need users, comments
/// need posts).
pub fn default_registry() -> Result<StepRegistry, RegistryError> {
    let mut registry = StepRegistry::new();
    registry
        .register(
            FieldMapStep::new("users", "users_legacy", "users")
                .rename("username", "display_name")
                .rename("avatar", "avatar_url")
                .drop_field("password_salt")
                .require("email")
                .skip_when("deleted", json!(true))
                .also_drop("sessions_legacy"),
        )?
        .register(
            FieldMapStep::new("plants", "plants_legacy", "plants")
                .rename("owner", "owner_id")
                .rename("nickname", "name")
                .rename("water_every_days", "watering_interval_days")
                .require("owner")
                .skip_when("archived", json!(true)),
        )?
        .register(
            FieldMapStep::new("posts", "forum_posts_legacy", "posts")
                .rename("author", "author_id")
                .rename("text", "body")
                .require("author")
                .skip_when("deleted", json!(true)),
        )?
        .register(
            FieldMapStep::new("comments", "forum_comments_legacy", "comments")
                .rename("post", "post_id")
                .rename("author", "author_id")
                .rename("text", "body")
                .require("post")
                .skip_when("deleted", json!(true)),
        )?
        .register(
            FieldMapStep::new("notifications", "notifications_legacy", "notifications")
                .rename("user", "user_id")
                .rename("msg", "message")
                .rename("read", "is_read")
                .require("user")
                .skip_when("dismissed", json!(true)),
        )?;
    Ok(registry)
}
