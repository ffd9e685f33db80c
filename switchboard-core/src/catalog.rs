// src/catalog.rs
//
// Snapshot of the EventSub subscription types the bridge accepts, with the
// transport and scope rules that drive upstream subscription creation.
// Source: https://dev.twitch.tv/docs/eventsub/eventsub-subscription-types/

pub struct CatalogEntry {
    pub event_type: &'static str,
    pub version: &'static str,
}

pub const EVENTSUB_CATALOG: &[CatalogEntry] = &[
    CatalogEntry { event_type: "automod.message.hold", version: "2" },
    CatalogEntry { event_type: "automod.message.update", version: "2" },
    CatalogEntry { event_type: "automod.settings.update", version: "1" },
    CatalogEntry { event_type: "automod.terms.update", version: "1" },
    CatalogEntry { event_type: "channel.bits.use", version: "1" },
    CatalogEntry { event_type: "channel.update", version: "2" },
    CatalogEntry { event_type: "channel.follow", version: "2" },
    CatalogEntry { event_type: "channel.ad_break.begin", version: "1" },
    CatalogEntry { event_type: "channel.chat.clear", version: "1" },
    CatalogEntry { event_type: "channel.chat.clear_user_messages", version: "1" },
    CatalogEntry { event_type: "channel.chat.message", version: "1" },
    CatalogEntry { event_type: "channel.chat.message_delete", version: "1" },
    CatalogEntry { event_type: "channel.chat.notification", version: "1" },
    CatalogEntry { event_type: "channel.chat_settings.update", version: "1" },
    CatalogEntry { event_type: "channel.chat.user_message_hold", version: "1" },
    CatalogEntry { event_type: "channel.chat.user_message_update", version: "1" },
    CatalogEntry { event_type: "channel.shared_chat.begin", version: "1" },
    CatalogEntry { event_type: "channel.shared_chat.update", version: "1" },
    CatalogEntry { event_type: "channel.shared_chat.end", version: "1" },
    CatalogEntry { event_type: "channel.subscribe", version: "1" },
    CatalogEntry { event_type: "channel.subscription.end", version: "1" },
    CatalogEntry { event_type: "channel.subscription.gift", version: "1" },
    CatalogEntry { event_type: "channel.subscription.message", version: "1" },
    CatalogEntry { event_type: "channel.cheer", version: "1" },
    CatalogEntry { event_type: "channel.raid", version: "1" },
    CatalogEntry { event_type: "channel.ban", version: "1" },
    CatalogEntry { event_type: "channel.unban", version: "1" },
    CatalogEntry { event_type: "channel.unban_request.create", version: "1" },
    CatalogEntry { event_type: "channel.unban_request.resolve", version: "1" },
    CatalogEntry { event_type: "channel.moderate", version: "2" },
    CatalogEntry { event_type: "channel.moderator.add", version: "1" },
    CatalogEntry { event_type: "channel.moderator.remove", version: "1" },
    CatalogEntry { event_type: "channel.channel_points_automatic_reward_redemption.add", version: "2" },
    CatalogEntry { event_type: "channel.channel_points_custom_reward.add", version: "1" },
    CatalogEntry { event_type: "channel.channel_points_custom_reward.update", version: "1" },
    CatalogEntry { event_type: "channel.channel_points_custom_reward.remove", version: "1" },
    CatalogEntry { event_type: "channel.channel_points_custom_reward_redemption.add", version: "1" },
    CatalogEntry { event_type: "channel.channel_points_custom_reward_redemption.update", version: "1" },
    CatalogEntry { event_type: "channel.poll.begin", version: "1" },
    CatalogEntry { event_type: "channel.poll.progress", version: "1" },
    CatalogEntry { event_type: "channel.poll.end", version: "1" },
    CatalogEntry { event_type: "channel.prediction.begin", version: "1" },
    CatalogEntry { event_type: "channel.prediction.progress", version: "1" },
    CatalogEntry { event_type: "channel.prediction.lock", version: "1" },
    CatalogEntry { event_type: "channel.prediction.end", version: "1" },
    CatalogEntry { event_type: "channel.suspicious_user.message", version: "1" },
    CatalogEntry { event_type: "channel.suspicious_user.update", version: "1" },
    CatalogEntry { event_type: "channel.vip.add", version: "1" },
    CatalogEntry { event_type: "channel.vip.remove", version: "1" },
    CatalogEntry { event_type: "channel.warning.acknowledge", version: "1" },
    CatalogEntry { event_type: "channel.warning.send", version: "1" },
    CatalogEntry { event_type: "channel.charity_campaign.donate", version: "1" },
    CatalogEntry { event_type: "channel.charity_campaign.start", version: "1" },
    CatalogEntry { event_type: "channel.charity_campaign.progress", version: "1" },
    CatalogEntry { event_type: "channel.charity_campaign.stop", version: "1" },
    CatalogEntry { event_type: "conduit.shard.disabled", version: "1" },
    CatalogEntry { event_type: "drop.entitlement.grant", version: "1" },
    CatalogEntry { event_type: "extension.bits_transaction.create", version: "1" },
    CatalogEntry { event_type: "channel.goal.begin", version: "1" },
    CatalogEntry { event_type: "channel.goal.progress", version: "1" },
    CatalogEntry { event_type: "channel.goal.end", version: "1" },
    CatalogEntry { event_type: "channel.hype_train.begin", version: "2" },
    CatalogEntry { event_type: "channel.hype_train.progress", version: "2" },
    CatalogEntry { event_type: "channel.hype_train.end", version: "2" },
    CatalogEntry { event_type: "channel.shield_mode.begin", version: "1" },
    CatalogEntry { event_type: "channel.shield_mode.end", version: "1" },
    CatalogEntry { event_type: "channel.shoutout.create", version: "1" },
    CatalogEntry { event_type: "channel.shoutout.receive", version: "1" },
    CatalogEntry { event_type: "stream.online", version: "1" },
    CatalogEntry { event_type: "stream.offline", version: "1" },
    CatalogEntry { event_type: "user.authorization.grant", version: "1" },
    CatalogEntry { event_type: "user.authorization.revoke", version: "1" },
    CatalogEntry { event_type: "user.update", version: "1" },
    CatalogEntry { event_type: "user.whisper.message", version: "1" },
];

/// Webhook-only per Twitch docs; these can never ride the WebSocket session.
const WEBSOCKET_UNSUPPORTED: &[&str] = &[
    "drop.entitlement.grant",
    "extension.bits_transaction.create",
    "user.authorization.grant",
    "user.authorization.revoke",
];

pub fn is_known_event_type(event_type: &str) -> bool {
    EVENTSUB_CATALOG.iter().any(|e| e.event_type == event_type)
}

pub fn preferred_version(event_type: &str) -> &'static str {
    EVENTSUB_CATALOG
        .iter()
        .find(|e| e.event_type == event_type)
        .map(|e| e.version)
        .unwrap_or("1")
}

pub fn is_webhook_only(event_type: &str) -> bool {
    WEBSOCKET_UNSUPPORTED.contains(&event_type)
}

pub fn is_websocket_capable(event_type: &str) -> bool {
    !is_webhook_only(event_type)
}

/// Chat subscriptions carry a `user_id` condition naming the reading bot.
pub fn requires_condition_user_id(event_type: &str) -> bool {
    event_type.starts_with("channel.chat.") || event_type == "channel.chat_settings.update"
}

/// Scope groups the authorizing token must satisfy: one scope out of each
/// group. Empty means no user-scope requirement beyond channel:bot.
pub fn required_scope_groups(event_type: &str) -> Vec<Vec<&'static str>> {
    if event_type.starts_with("channel.channel_points_custom_reward") {
        return vec![vec!["channel:read:redemptions", "channel:manage:redemptions"]];
    }
    if event_type.starts_with("channel.poll.") {
        return vec![vec!["channel:read:polls", "channel:manage:polls"]];
    }
    if event_type.starts_with("channel.prediction.") {
        return vec![vec!["channel:read:predictions", "channel:manage:predictions"]];
    }
    if event_type.starts_with("channel.goal.") {
        return vec![vec!["channel:read:goals"]];
    }
    if event_type.starts_with("channel.charity_campaign.") {
        return vec![vec!["channel:read:charity"]];
    }
    if event_type == "channel.ad_break.begin" {
        return vec![vec!["channel:read:ads"]];
    }
    if event_type.starts_with("channel.hype_train.") {
        return vec![vec!["channel:read:hype_train"]];
    }
    Vec::new()
}

/// True when `scopes` satisfies every required group for `event_type`.
pub fn scopes_satisfy(event_type: &str, scopes: &[String]) -> bool {
    required_scope_groups(event_type)
        .iter()
        .all(|group| group.iter().any(|needed| scopes.iter().any(|s| s == needed)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_types_include_core_events() {
        assert!(is_known_event_type("channel.chat.message"));
        assert!(is_known_event_type("stream.online"));
        assert!(!is_known_event_type("channel.online"));
    }

    #[test]
    fn webhook_only_types_are_not_websocket_capable() {
        assert!(is_webhook_only("drop.entitlement.grant"));
        assert!(is_webhook_only("user.authorization.revoke"));
        assert!(!is_websocket_capable("user.authorization.grant"));
        assert!(is_websocket_capable("channel.follow"));
    }

    #[test]
    fn chat_types_require_condition_user_id() {
        assert!(requires_condition_user_id("channel.chat.message"));
        assert!(requires_condition_user_id("channel.chat_settings.update"));
        assert!(!requires_condition_user_id("channel.follow"));
    }

    #[test]
    fn preferred_versions_follow_catalog() {
        assert_eq!(preferred_version("channel.follow"), "2");
        assert_eq!(preferred_version("channel.hype_train.begin"), "2");
        assert_eq!(preferred_version("stream.online"), "1");
        assert_eq!(preferred_version("never.seen"), "1");
    }

    #[test]
    fn scope_groups_accept_any_member() {
        let read = vec!["channel:read:polls".to_string()];
        let manage = vec!["channel:manage:polls".to_string()];
        let unrelated = vec!["bits:read".to_string()];
        assert!(scopes_satisfy("channel.poll.begin", &read));
        assert!(scopes_satisfy("channel.poll.begin", &manage));
        assert!(!scopes_satisfy("channel.poll.begin", &unrelated));
        assert!(scopes_satisfy("channel.follow", &unrelated));
    }
}
