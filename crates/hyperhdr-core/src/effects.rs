// ── Effect catalog ordering ──

const MUSIC_PREFIX: &str = "Music:";

/// Order an effect list for presentation: classic effects first, then
/// music-driven effects, each group keeping its reported relative
/// order. Callers rely on this ordering for menu layout.
pub fn sort_effects<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut classic = Vec::new();
    let mut music = Vec::new();

    for name in names {
        let name = name.into();
        if name.starts_with(MUSIC_PREFIX) {
            music.push(name);
        } else {
            classic.push(name);
        }
    }

    classic.append(&mut music);
    classic
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classic_before_music_stable_within_groups() {
        let sorted = sort_effects(["A", "Music: B", "C", "Music: D"]);
        assert_eq!(sorted, ["A", "C", "Music: B", "Music: D"]);
    }

    #[test]
    fn all_music_keeps_order() {
        let sorted = sort_effects(["Music: pulse", "Music: wave"]);
        assert_eq!(sorted, ["Music: pulse", "Music: wave"]);
    }

    #[test]
    fn empty_list() {
        assert!(sort_effects(Vec::<String>::new()).is_empty());
    }

    #[test]
    fn prefix_match_is_literal() {
        // "Musical chairs" is not a music effect.
        let sorted = sort_effects(["Music: beat", "Musical chairs"]);
        assert_eq!(sorted, ["Musical chairs", "Music: beat"]);
    }
}
