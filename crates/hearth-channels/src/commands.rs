//! `!` text commands.
//!
//! Parsing only; [`crate::dispatcher`] runs them. Unknown commands parse to
//! `None` so other bots sharing the prefix are left alone, while a known
//! command with bad arguments parses to [`BotCommand::Usage`].

use hearth_core::AccessLevel;

pub const HELP_TEXT: &str = "\
**hearth commands**
`!room show` / `!room hide` - make your room visible or hidden
`!room grant @user... [manage]` - let people into your room
`!room limit <0-99>` - cap your room (0 = no cap)
`!jam <link>` - share a jam link
`!bind #channel <message id> <emoji> @role` - react-for-role (admin)
`!unbind #channel <message id> <emoji>` - remove a binding (admin)
`!feed preview` - post the latest feed item without advancing it (admin)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    RoomVisibility {
        visible: bool,
    },
    RoomGrant {
        grantees: Vec<String>,
        access: AccessLevel,
    },
    RoomLimit {
        limit: i64,
    },
    Bind {
        context_id: String,
        trigger_id: String,
        signal_key: String,
        effect_id: String,
    },
    Unbind {
        context_id: String,
        trigger_id: String,
        signal_key: String,
    },
    FeedPreview,
    Jam {
        link: String,
    },
    Help,
    /// Known command, wrong arguments. Holds the usage line.
    Usage(&'static str),
}

impl BotCommand {
    pub fn is_admin_only(&self) -> bool {
        matches!(
            self,
            BotCommand::Bind { .. } | BotCommand::Unbind { .. } | BotCommand::FeedPreview
        )
    }
}

fn is_snowflake(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Strips `open`...`>` around an id, accepting a bare id too.
fn mention_id<'a>(token: &'a str, prefixes: &[&str]) -> Option<&'a str> {
    let inner = prefixes
        .iter()
        .find_map(|p| token.strip_prefix(p).and_then(|rest| rest.strip_suffix('>')))
        .unwrap_or(token);
    is_snowflake(inner).then_some(inner)
}

pub fn parse_user(token: &str) -> Option<&str> {
    mention_id(token, &["<@!", "<@"])
}

pub fn parse_role(token: &str) -> Option<&str> {
    mention_id(token, &["<@&"])
}

pub fn parse_channel(token: &str) -> Option<&str> {
    mention_id(token, &["<#"])
}

/// `<:name:id>` and `<a:name:id>` become `name:id`; anything else is taken
/// as a unicode emoji.
pub fn parse_emoji(token: &str) -> Option<String> {
    if let Some(inner) = token.strip_prefix('<').and_then(|t| t.strip_suffix('>')) {
        let inner = inner.strip_prefix('a').unwrap_or(inner);
        let mut parts = inner.strip_prefix(':')?.splitn(2, ':');
        let name = parts.next().filter(|n| !n.is_empty())?;
        let id = parts.next().filter(|id| is_snowflake(id))?;
        return Some(format!("{name}:{id}"));
    }
    let token = token.trim();
    if token.is_empty() || token.is_ascii() {
        return None;
    }
    Some(token.to_string())
}

pub fn parse_command(content: &str) -> Option<BotCommand> {
    let body = content.trim().strip_prefix('!')?;
    let mut words = body.split_whitespace();
    let name = words.next()?.to_lowercase();
    let args: Vec<&str> = words.collect();

    let command = match name.as_str() {
        "help" => BotCommand::Help,
        "jam" => match args.as_slice() {
            [link] => BotCommand::Jam {
                link: (*link).to_string(),
            },
            _ => BotCommand::Usage("`!jam <link>`"),
        },
        "room" => parse_room(&args),
        "bind" => match args.as_slice() {
            [channel, message, emoji, role] => {
                match (
                    parse_channel(channel),
                    is_snowflake(message),
                    parse_emoji(emoji),
                    parse_role(role),
                ) {
                    (Some(context_id), true, Some(signal_key), Some(effect_id)) => {
                        BotCommand::Bind {
                            context_id: context_id.to_string(),
                            trigger_id: (*message).to_string(),
                            signal_key,
                            effect_id: effect_id.to_string(),
                        }
                    }
                    _ => BotCommand::Usage("`!bind #channel <message id> <emoji> @role`"),
                }
            }
            _ => BotCommand::Usage("`!bind #channel <message id> <emoji> @role`"),
        },
        "unbind" => match args.as_slice() {
            [channel, message, emoji] => {
                match (parse_channel(channel), is_snowflake(message), parse_emoji(emoji)) {
                    (Some(context_id), true, Some(signal_key)) => BotCommand::Unbind {
                        context_id: context_id.to_string(),
                        trigger_id: (*message).to_string(),
                        signal_key,
                    },
                    _ => BotCommand::Usage("`!unbind #channel <message id> <emoji>`"),
                }
            }
            _ => BotCommand::Usage("`!unbind #channel <message id> <emoji>`"),
        },
        "feed" => match args.as_slice() {
            ["preview"] => BotCommand::FeedPreview,
            _ => BotCommand::Usage("`!feed preview`"),
        },
        _ => return None,
    };
    Some(command)
}

fn parse_room(args: &[&str]) -> BotCommand {
    const USAGE: &str = "`!room show|hide`, `!room grant @user... [manage]` or `!room limit <0-99>`";
    match args {
        ["show"] => BotCommand::RoomVisibility { visible: true },
        ["hide"] => BotCommand::RoomVisibility { visible: false },
        ["limit", value] => match value.parse::<i64>() {
            Ok(limit) => BotCommand::RoomLimit { limit },
            Err(_) => BotCommand::Usage(USAGE),
        },
        ["grant", rest @ ..] => {
            let (access, users) = match rest.split_last() {
                Some((last, users)) if last.eq_ignore_ascii_case("manage") => {
                    (AccessLevel::Manage, users)
                }
                _ => (AccessLevel::Join, rest),
            };
            let grantees: Option<Vec<String>> = users
                .iter()
                .map(|u| parse_user(u).map(str::to_string))
                .collect();
            match grantees {
                Some(grantees) if !grantees.is_empty() => {
                    BotCommand::RoomGrant { grantees, access }
                }
                _ => BotCommand::Usage(USAGE),
            }
        }
        _ => BotCommand::Usage(USAGE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_commands_and_unknown_commands_are_ignored() {
        assert_eq!(parse_command("hello"), None);
        assert_eq!(parse_command("!play despacito"), None);
        assert_eq!(parse_command("!"), None);
    }

    #[test]
    fn room_visibility() {
        assert_eq!(
            parse_command("!room hide"),
            Some(BotCommand::RoomVisibility { visible: false })
        );
        assert_eq!(
            parse_command("!ROOM show"),
            Some(BotCommand::RoomVisibility { visible: true })
        );
    }

    #[test]
    fn room_limit_keeps_out_of_range_values_for_validation() {
        assert_eq!(
            parse_command("!room limit 150"),
            Some(BotCommand::RoomLimit { limit: 150 })
        );
        assert!(matches!(
            parse_command("!room limit lots"),
            Some(BotCommand::Usage(_))
        ));
    }

    #[test]
    fn room_grant_accepts_mentions_and_manage_flag() {
        assert_eq!(
            parse_command("!room grant <@111> <@!222> manage"),
            Some(BotCommand::RoomGrant {
                grantees: vec!["111".into(), "222".into()],
                access: AccessLevel::Manage,
            })
        );
        assert_eq!(
            parse_command("!room grant 333"),
            Some(BotCommand::RoomGrant {
                grantees: vec!["333".into()],
                access: AccessLevel::Join,
            })
        );
        assert!(matches!(
            parse_command("!room grant manage"),
            Some(BotCommand::Usage(_))
        ));
        assert!(matches!(
            parse_command("!room grant @sam"),
            Some(BotCommand::Usage(_))
        ));
    }

    #[test]
    fn bind_with_custom_emoji() {
        let cmd = parse_command("!bind <#10> 20 <a:party:30> <@&40>").unwrap();
        assert_eq!(
            cmd,
            BotCommand::Bind {
                context_id: "10".into(),
                trigger_id: "20".into(),
                signal_key: "party:30".into(),
                effect_id: "40".into(),
            }
        );
        assert!(cmd.is_admin_only());
    }

    #[test]
    fn bind_with_unicode_emoji_and_bare_ids() {
        assert_eq!(
            parse_command("!bind 10 20 🎮 40"),
            Some(BotCommand::Bind {
                context_id: "10".into(),
                trigger_id: "20".into(),
                signal_key: "🎮".into(),
                effect_id: "40".into(),
            })
        );
    }

    #[test]
    fn bind_rejects_plain_words_as_emoji() {
        assert!(matches!(
            parse_command("!bind <#10> 20 gaming <@&40>"),
            Some(BotCommand::Usage(_))
        ));
        assert!(matches!(parse_command("!bind"), Some(BotCommand::Usage(_))));
    }

    #[test]
    fn unbind_and_feed_are_admin_only() {
        let unbind = parse_command("!unbind <#10> 20 <:party:30>").unwrap();
        assert_eq!(
            unbind,
            BotCommand::Unbind {
                context_id: "10".into(),
                trigger_id: "20".into(),
                signal_key: "party:30".into(),
            }
        );
        assert!(unbind.is_admin_only());
        assert_eq!(parse_command("!feed preview"), Some(BotCommand::FeedPreview));
        assert!(!BotCommand::Help.is_admin_only());
    }

    #[test]
    fn jam_needs_exactly_one_link() {
        assert_eq!(
            parse_command("!jam https://spotify.link/abc"),
            Some(BotCommand::Jam {
                link: "https://spotify.link/abc".into()
            })
        );
        assert!(matches!(parse_command("!jam"), Some(BotCommand::Usage(_))));
    }

    #[test]
    fn mention_parsers() {
        assert_eq!(parse_user("<@!5>"), Some("5"));
        assert_eq!(parse_role("<@&6>"), Some("6"));
        assert_eq!(parse_channel("<#7>"), Some("7"));
        assert_eq!(parse_channel("<#x>"), None);
        assert_eq!(parse_emoji("<:x>"), None);
    }
}
