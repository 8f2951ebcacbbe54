//! Cross-venue event matching: token-overlap similarity, start-time bucket
//! proximity, transitive grouping, and lifecycle classification.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::model::{EventPhase, MatchedGroup, VendorEvent};

#[derive(Debug, Clone)]
pub struct MatcherConfig {
    /// Width of one start-time bucket (ms)
    pub time_tolerance_ms: i64,
    /// Minimum shared tokens for a textual match
    pub min_overlap: usize,
    /// Minimum overlap / min(|A|,|B|)
    pub min_coverage: f64,
}

/// Token-set similarity between two normalized titles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub overlap: usize,
    /// overlap / min(|A|, |B|)
    pub coverage: f64,
    /// overlap / |A ∪ B|
    pub jaccard: f64,
}

pub fn similarity(a: &BTreeSet<String>, b: &BTreeSet<String>) -> Similarity {
    let overlap = a.intersection(b).count();
    let union = a.union(b).count();
    let smaller = a.len().min(b.len());
    Similarity {
        overlap,
        coverage: if smaller == 0 {
            0.0
        } else {
            overlap as f64 / smaller as f64
        },
        jaccard: if union == 0 {
            0.0
        } else {
            overlap as f64 / union as f64
        },
    }
}

/// Bucket index for a start time: `round(start_ms / tolerance_ms)`.
pub fn time_bucket(start_ms: i64, tolerance_ms: i64) -> i64 {
    (start_ms as f64 / tolerance_ms as f64).round() as i64
}

/// Ceiling for comparisons where only one side knows its start time.  A
/// market close lands hours after the other venue's tipoff, so the bucket
/// gate would reject the same game; a rematch days later must still fail.
const MIXED_KIND_TOLERANCE_MS: i64 = 12 * 60 * 60 * 1000;

/// Two events are time-compatible when their buckets differ by at most 1.
/// Buckets are only comparable between timestamps of the same kind: start
/// against start, or close against close when neither side has a start.  A
/// mixed pair falls back to a coarse same-half-day gate, and an event with
/// no timestamp at all does not constrain the match.
pub fn time_compatible(a: &VendorEvent, b: &VendorEvent, tolerance_ms: i64) -> bool {
    let bucketed = |ta: DateTime<Utc>, tb: DateTime<Utc>| {
        let ba = time_bucket(ta.timestamp_millis(), tolerance_ms);
        let bb = time_bucket(tb.timestamp_millis(), tolerance_ms);
        (ba - bb).abs() <= 1
    };
    match (a.start_time, b.start_time) {
        (Some(sa), Some(sb)) => bucketed(sa, sb),
        (None, None) => match (a.close_time, b.close_time) {
            (Some(ca), Some(cb)) => bucketed(ca, cb),
            _ => true,
        },
        _ => {
            let ta = a.start_time.or(a.close_time);
            let tb = b.start_time.or(b.close_time);
            match (ta, tb) {
                (Some(ta), Some(tb)) => {
                    (ta - tb).num_milliseconds().abs() <= MIXED_KIND_TOLERANCE_MS
                }
                _ => true,
            }
        }
    }
}

/// A cross-venue pair is matched only when both the textual and the temporal
/// condition hold.
pub fn events_match(a: &VendorEvent, b: &VendorEvent, cfg: &MatcherConfig) -> bool {
    if a.venue == b.venue {
        return false;
    }
    let sim = similarity(&a.tokens, &b.tokens);
    if sim.overlap < cfg.min_overlap || sim.coverage < cfg.min_coverage {
        return false;
    }
    time_compatible(a, b, cfg.time_tolerance_ms)
}

/// Lifecycle phase of a single vendor event at `now`.
///
/// `Ended` when the venue reports the event closed/settled or `now` has
/// reached the close time; otherwise `Pre` before the start time and `Live`
/// between start and close.  Events with neither time default to `Pre`.
pub fn classify_phase(event: &VendorEvent, now: DateTime<Utc>) -> EventPhase {
    if event.vendor_closed {
        return EventPhase::Ended;
    }
    if let Some(close) = event.close_time {
        if now >= close {
            return EventPhase::Ended;
        }
    }
    match (event.start_time, event.close_time) {
        (Some(start), _) if now < start => EventPhase::Pre,
        (Some(_), _) => EventPhase::Live,
        (None, Some(_)) => EventPhase::Pre,
        (None, None) => EventPhase::Pre,
    }
}

/// Aggregate phase for a group: `Live` if any member is live, `Ended` only
/// when every member has ended, else `Pre`.
pub fn aggregate_phase(phases: &[EventPhase]) -> EventPhase {
    if phases.iter().any(|p| *p == EventPhase::Live) {
        EventPhase::Live
    } else if !phases.is_empty() && phases.iter().all(|p| *p == EventPhase::Ended) {
        EventPhase::Ended
    } else {
        EventPhase::Pre
    }
}

/// Cluster vendor events into matched groups.
///
/// Pairwise matches are merged transitively (union-find); only clusters
/// spanning at least two distinct venues survive.
pub fn group_events(events: &[VendorEvent], cfg: &MatcherConfig, now: DateTime<Utc>) -> Vec<MatchedGroup> {
    let mut parent: Vec<usize> = (0..events.len()).collect();

    fn find(parent: &mut Vec<usize>, i: usize) -> usize {
        if parent[i] != i {
            let root = find(parent, parent[i]);
            parent[i] = root;
        }
        parent[i]
    }

    for i in 0..events.len() {
        for j in (i + 1)..events.len() {
            if events_match(&events[i], &events[j], cfg) {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[rj] = ri;
                }
            }
        }
    }

    let mut clusters: HashMap<usize, Vec<usize>> = HashMap::new();
    for i in 0..events.len() {
        let root = find(&mut parent, i);
        clusters.entry(root).or_default().push(i);
    }

    let mut groups: Vec<MatchedGroup> = clusters
        .into_values()
        .filter_map(|indices| {
            let members: Vec<VendorEvent> =
                indices.iter().map(|&i| events[i].clone()).collect();
            let venues: BTreeSet<_> = members.iter().map(|m| m.venue).collect();
            if venues.len() < 2 {
                return None;
            }
            let mut keys: Vec<String> = members
                .iter()
                .map(|m| format!("{}:{}", m.venue, m.event_id))
                .collect();
            keys.sort();
            let phases: Vec<EventPhase> =
                members.iter().map(|m| classify_phase(m, now)).collect();
            let sport = members.iter().find_map(|m| m.sport.clone());
            Some(MatchedGroup {
                key: keys.join("|"),
                sport,
                phase: aggregate_phase(&phases),
                members,
            })
        })
        .collect();

    // Deterministic output order for logging and tests
    groups.sort_by(|a, b| a.key.cmp(&b.key));
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::normalize::normalize;
    use crate::model::Venue;
    use chrono::Duration;

    fn event(
        venue: Venue,
        id: &str,
        title: &str,
        start: Option<DateTime<Utc>>,
    ) -> VendorEvent {
        let norm = normalize(title, None);
        VendorEvent {
            venue,
            event_id: id.to_string(),
            raw_title: title.to_string(),
            normalized_title: norm.title,
            tokens: norm.tokens,
            sport: Some("basketball".to_string()),
            vendor_closed: false,
            start_time: start,
            close_time: start.map(|s| s + Duration::hours(4)),
            home_team: None,
            away_team: None,
        }
    }

    fn toks(words: &[&str]) -> BTreeSet<String> {
        words.iter().map(|s| s.to_string()).collect()
    }

    fn cfg() -> MatcherConfig {
        MatcherConfig {
            time_tolerance_ms: 15 * 60 * 1000,
            min_overlap: 2,
            min_coverage: 0.5,
        }
    }

    #[test]
    fn test_similarity_bounds() {
        let a = toks(&["lakers", "celtics", "boston"]);
        let b = toks(&["lakers", "celtics"]);
        let sim = similarity(&a, &b);
        assert_eq!(sim.overlap, 2);
        assert!(sim.jaccard <= sim.coverage);
        assert!(sim.jaccard <= 1.0);
        assert!((0.0..=1.0).contains(&sim.coverage));
    }

    #[test]
    fn test_zero_overlap_zeroes_both_ratios() {
        let sim = similarity(&toks(&["lakers"]), &toks(&["yankees"]));
        assert_eq!(sim.overlap, 0);
        assert_eq!(sim.coverage, 0.0);
        assert_eq!(sim.jaccard, 0.0);
    }

    #[test]
    fn test_empty_sets() {
        let sim = similarity(&toks(&[]), &toks(&["lakers"]));
        assert_eq!(sim.overlap, 0);
        assert_eq!(sim.coverage, 0.0);
        assert_eq!(sim.jaccard, 0.0);
    }

    #[test]
    fn test_time_bucket_symmetry() {
        let t = Utc::now();
        let a = event(Venue::Kalshi, "a", "Lakers vs Celtics", Some(t));
        let b = event(
            Venue::Sportsbook,
            "b",
            "Lakers vs Celtics",
            Some(t + Duration::minutes(14)),
        );
        let tol = cfg().time_tolerance_ms;
        assert_eq!(
            time_compatible(&a, &b, tol),
            time_compatible(&b, &a, tol)
        );
    }

    #[test]
    fn test_far_apart_start_times_block_match() {
        let t = Utc::now();
        let a = event(Venue::Kalshi, "a", "Lakers vs Celtics", Some(t));
        let b = event(
            Venue::Sportsbook,
            "b",
            "Lakers vs Celtics",
            Some(t + Duration::hours(26)),
        );
        assert!(!events_match(&a, &b, &cfg()));
    }

    #[test]
    fn test_close_only_listing_matches_same_game_start() {
        // An exchange that reports only a market close (roughly game end,
        // hours after tipoff) must still group with a venue reporting the
        // start time.
        let start = Utc::now() + Duration::hours(2);
        let mut a = event(Venue::Kalshi, "a", "Lakers vs Celtics", None);
        a.close_time = Some(start + Duration::hours(3));
        let b = event(Venue::Sportsbook, "b", "Lakers vs Celtics", Some(start));
        assert!(events_match(&a, &b, &cfg()));

        // A rematch days later still fails the coarse gate
        let mut rematch = event(Venue::Kalshi, "a2", "Lakers vs Celtics", None);
        rematch.close_time = Some(start + Duration::days(3));
        assert!(!events_match(&rematch, &b, &cfg()));
    }

    #[test]
    fn test_same_venue_never_matches() {
        let t = Utc::now();
        let a = event(Venue::Kalshi, "a", "Lakers vs Celtics", Some(t));
        let b = event(Venue::Kalshi, "b", "Lakers vs Celtics", Some(t));
        assert!(!events_match(&a, &b, &cfg()));
    }

    #[test]
    fn test_three_venue_grouping_scenario() {
        // Three differently-phrased listings for the same game must land in
        // one group spanning all three venues.
        let t = Utc::now() + Duration::hours(5);
        let events = vec![
            event(Venue::Kalshi, "k1", "Lakers vs Celtics", Some(t)),
            event(
                Venue::Polymarket,
                "p1",
                "LA Lakers @ Boston Celtics",
                Some(t + Duration::minutes(2)),
            ),
            event(
                Venue::Sportsbook,
                "s1",
                "Celtics-Lakers Moneyline",
                Some(t - Duration::minutes(1)),
            ),
        ];
        let groups = group_events(&events, &cfg(), Utc::now());
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].members.len(), 3);
        assert_eq!(groups[0].venues().len(), 3);
        assert_eq!(groups[0].phase, EventPhase::Pre);
    }

    #[test]
    fn test_unrelated_events_do_not_group() {
        let t = Utc::now();
        let events = vec![
            event(Venue::Kalshi, "k1", "Lakers vs Celtics", Some(t)),
            event(Venue::Polymarket, "p1", "Yankees vs Red Sox", Some(t)),
        ];
        assert!(group_events(&events, &cfg(), Utc::now()).is_empty());
    }

    #[test]
    fn test_single_venue_cluster_dropped() {
        let t = Utc::now();
        let events = vec![event(Venue::Kalshi, "k1", "Lakers vs Celtics", Some(t))];
        assert!(group_events(&events, &cfg(), Utc::now()).is_empty());
    }

    #[test]
    fn test_classify_phase() {
        let now = Utc::now();
        let mut e = event(Venue::Kalshi, "k", "Lakers vs Celtics", Some(now + Duration::hours(1)));
        assert_eq!(classify_phase(&e, now), EventPhase::Pre);

        e.start_time = Some(now - Duration::hours(1));
        assert_eq!(classify_phase(&e, now), EventPhase::Live);

        e.close_time = Some(now - Duration::minutes(5));
        assert_eq!(classify_phase(&e, now), EventPhase::Ended);
    }

    #[test]
    fn test_vendor_closed_wins_over_times() {
        let now = Utc::now();
        let mut e = event(Venue::Kalshi, "k", "Lakers vs Celtics", Some(now + Duration::hours(1)));
        e.vendor_closed = true;
        assert_eq!(classify_phase(&e, now), EventPhase::Ended);
    }

    #[test]
    fn test_no_times_defaults_to_pre() {
        let mut e = event(Venue::Polymarket, "p", "Lakers vs Celtics", None);
        e.close_time = None;
        assert_eq!(classify_phase(&e, Utc::now()), EventPhase::Pre);
    }

    #[test]
    fn test_aggregate_phase() {
        use EventPhase::*;
        assert_eq!(aggregate_phase(&[Pre, Live, Ended]), Live);
        assert_eq!(aggregate_phase(&[Ended, Ended]), Ended);
        assert_eq!(aggregate_phase(&[Pre, Ended]), Pre);
        assert_eq!(aggregate_phase(&[]), Pre);
    }
}
