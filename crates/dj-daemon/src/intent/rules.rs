//! Deterministic intent rules.  Each rule sees the normalized message and the
//! vibe catalog and either claims the message or passes.

use std::sync::LazyLock;

use dj_proto::vibes::VibeCatalog;
use regex::Regex;

use super::Intent;

pub type Rule = fn(&str, &VibeCatalog) -> Option<Intent>;

/// Evaluation order matters: status questions beat "play ..." so that
/// "play? what's playing" reads as a question.
pub const RULES: &[Rule] = &[
    status_now,
    status_next,
    help,
    song_request,
    explicit_vibe_switch,
    vibe_mention,
];

static NOW_PLAYING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"what's playing|whats playing|now playing|current song|playing now").unwrap()
});

static UP_NEXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"what's next|whats next|up next|next song|queue\s*\?").unwrap());

static HELP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bhelp\b|what can you do|commands").unwrap());

static SONG_VERB: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:play|queue|add|spin|drop|put on|put in|request)\b\s*(.*)$").unwrap()
});

static VIBE_SWITCH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:switch|set|change)\s+(?:the\s+)?vibe").unwrap());

static MOOD_WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"vibe|mood|playlist|energy|focus|chill|study|party|hype|instrumental").unwrap()
});

pub fn status_now(text: &str, _: &VibeCatalog) -> Option<Intent> {
    NOW_PLAYING.is_match(text).then_some(Intent::StatusNow)
}

pub fn status_next(text: &str, _: &VibeCatalog) -> Option<Intent> {
    UP_NEXT.is_match(text).then_some(Intent::StatusNext)
}

pub fn help(text: &str, _: &VibeCatalog) -> Option<Intent> {
    HELP.is_match(text).then_some(Intent::Help)
}

/// `play|queue|add|... <query>`; a bare verb falls through.
pub fn song_request(text: &str, _: &VibeCatalog) -> Option<Intent> {
    let caps = SONG_VERB.captures(text)?;
    let query = caps.get(1)?.as_str().trim();
    if query.is_empty() {
        return None;
    }
    Some(Intent::SongRequest {
        query: query.to_string(),
    })
}

/// "switch the vibe to chill" → vibe "chill".
pub fn explicit_vibe_switch(text: &str, _: &VibeCatalog) -> Option<Intent> {
    if !VIBE_SWITCH.is_match(text) {
        return None;
    }
    let idx = text.find("vibe")?;
    let rest = text[idx + "vibe".len()..].trim();
    let rest = rest.strip_prefix("to ").unwrap_or(rest).trim();
    if rest.is_empty() {
        return None;
    }
    Some(Intent::VibeRequest {
        vibe: rest.to_string(),
    })
}

/// A configured vibe mentioned alongside a mood word, e.g. "switch to focus".
/// The mood word keeps ordinary chat that happens to contain a vibe name from
/// turning into a switch.
pub fn vibe_mention(text: &str, catalog: &VibeCatalog) -> Option<Intent> {
    if !MOOD_WORD.is_match(text) {
        return None;
    }
    let hit = catalog.find_fuzzy(text)?;
    Some(Intent::VibeRequest { vibe: hit.matched })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dj_proto::vibes::Vibe;

    fn catalog() -> VibeCatalog {
        VibeCatalog {
            vibes: vec![
                Vibe {
                    id: "pl.chill".into(),
                    name: "Chill".into(),
                    aliases: vec!["lofi".into()],
                },
                Vibe {
                    id: "pl.focus".into(),
                    name: "Deep Work".into(),
                    aliases: vec!["focus".into()],
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_song_request_rule() {
        let c = catalog();
        assert_eq!(
            song_request("play get lucky", &c),
            Some(Intent::SongRequest {
                query: "get lucky".into()
            })
        );
        assert_eq!(
            song_request("put on around the world", &c),
            Some(Intent::SongRequest {
                query: "around the world".into()
            })
        );
        assert_eq!(song_request("play", &c), None);
        assert_eq!(song_request("play   ", &c), None);
        // verb must lead and be a whole word
        assert_eq!(song_request("playlist please", &c), None);
        assert_eq!(song_request("can you play x", &c), None);
    }

    #[test]
    fn test_status_rules() {
        let c = catalog();
        assert_eq!(status_now("yo what's playing", &c), Some(Intent::StatusNow));
        assert_eq!(status_next("what's next", &c), Some(Intent::StatusNext));
        assert_eq!(status_next("queue ?", &c), Some(Intent::StatusNext));
        assert_eq!(status_now("what's next", &c), None);
    }

    #[test]
    fn test_help_rule_needs_whole_word() {
        let c = catalog();
        assert_eq!(help("help", &c), Some(Intent::Help));
        assert_eq!(help("what can you do?", &c), Some(Intent::Help));
        assert_eq!(help("helpful track", &c), None);
    }

    #[test]
    fn test_explicit_switch_strips_to() {
        let c = catalog();
        assert_eq!(
            explicit_vibe_switch("switch the vibe to late night", &c),
            Some(Intent::VibeRequest {
                vibe: "late night".into()
            })
        );
        assert_eq!(
            explicit_vibe_switch("change vibe chill", &c),
            Some(Intent::VibeRequest {
                vibe: "chill".into()
            })
        );
        assert_eq!(explicit_vibe_switch("change the vibe", &c), None);
    }

    #[test]
    fn test_vibe_mention_gated_by_mood_word() {
        let c = catalog();
        assert_eq!(
            vibe_mention("switch to focus", &c),
            Some(Intent::VibeRequest {
                vibe: "focus".into()
            })
        );
        assert_eq!(
            vibe_mention("some lofi mood please", &c),
            Some(Intent::VibeRequest {
                vibe: "lofi".into()
            })
        );
        // names a vibe but no mood word
        assert_eq!(vibe_mention("i love lofi", &c), None);
        // mood word but no vibe
        assert_eq!(vibe_mention("what a party", &c), None);
    }
}
