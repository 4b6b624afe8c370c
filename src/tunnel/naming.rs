//! Subdomain label generation.
//!
//! A label is four words, one drawn from each list, joined by hyphens in a
//! fixed order: count prefix, phonetic alphabet, star, place
//! (e.g. `di-bravo-vega-paris`).

use rand::Rng;

const COUNT_PREFIXES: &[&str] = &[
    "mono", "di", "tri", "tetra", "penta", "hexa", "hepta", "octa", "nona", "deca", "undeca",
    "dodeca", "trideca", "tetradeca", "pentadeca", "hexadeca", "heptadeca", "octadeca",
    "nonadeca", "icosa", "henicosa", "docosa", "tricoda", "tetracosa", "pentacosa", "hexacosa",
    "heptacosa", "octacosa", "nonacosa",
];

const PHONETIC: &[&str] = &[
    "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel", "india", "juliette",
    "kilo", "lima", "mike", "november", "oscar", "papa", "quebec", "romeo", "sierra", "tango",
    "uniform", "victor", "whiskey", "xray", "yankee", "zulu",
];

const STARS: &[&str] = &[
    "alpheratz", "ankaa", "schedar", "diphda", "achernar", "hamal", "acamar", "menkak", "mirfak",
    "aldebaran", "rigel", "capella", "bellatrix", "elnath", "alnilam", "betelgeuse", "canopus",
    "sirius", "adhara", "procyon", "pollux", "avior", "suhail", "miaplacidus", "alphard",
    "regulus", "dubhe", "denebola", "gienah", "acrux", "gacrux", "alioth", "spica", "alkaid",
    "hadar", "menkent", "rigil-kentaurus", "arcturus", "zubenelgenubi", "kochab", "alphecca",
    "antares", "atria", "sabik", "shaula", "rasalhague", "eltanin", "kaus-australis", "vega",
    "nunki", "altair", "peacock", "deneb", "enif", "al-nair", "fomalhaut", "markab", "polaris",
];

const PLACES: &[&str] = &[
    "ankara", "belgium", "berlin", "brest", "budapest", "bulgaria", "constantinople", "denmark",
    "edinburgh", "greece", "holland", "kiel", "liverpool", "london", "marseilles", "moscow",
    "munich", "naples", "norway", "paris", "portugal", "rome", "rumania", "stp", "serbia",
    "sevastopol", "smryna", "spain", "sweden", "trieste", "tunis", "venice", "vienna", "warsaw",
    "albania", "apulia", "bohemia", "burgundy", "clyde", "finland", "galicia", "gascony",
    "livonia", "picardy", "piedmont", "prussia", "ruhr", "silesia", "syria", "tuscany", "tyrolia",
    "ukraine", "wales", "yorkshire",
];

/// The four word lists labels are drawn from.
///
/// Immutable once constructed; handed to [`Registry::new`](super::registry::Registry::new).
#[derive(Debug, Clone)]
pub struct WordLists {
    counts: Vec<String>,
    phonetic: Vec<String>,
    stars: Vec<String>,
    places: Vec<String>,
}

impl WordLists {
    /// Build word lists from four sequences. Returns `None` if any list is empty.
    pub fn new<S: Into<String>>(
        counts: impl IntoIterator<Item = S>,
        phonetic: impl IntoIterator<Item = S>,
        stars: impl IntoIterator<Item = S>,
        places: impl IntoIterator<Item = S>,
    ) -> Option<Self> {
        let collect = |words: Vec<String>| (!words.is_empty()).then_some(words);
        Some(Self {
            counts: collect(counts.into_iter().map(Into::into).collect())?,
            phonetic: collect(phonetic.into_iter().map(Into::into).collect())?,
            stars: collect(stars.into_iter().map(Into::into).collect())?,
            places: collect(places.into_iter().map(Into::into).collect())?,
        })
    }

    /// Number of distinct labels these lists can produce.
    pub fn combinations(&self) -> usize {
        self.counts.len() * self.phonetic.len() * self.stars.len() * self.places.len()
    }

    /// Draw one label. Four independent draws, always in the same order.
    pub fn generate<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        let count = &self.counts[rng.gen_range(0..self.counts.len())];
        let phonetic = &self.phonetic[rng.gen_range(0..self.phonetic.len())];
        let star = &self.stars[rng.gen_range(0..self.stars.len())];
        let place = &self.places[rng.gen_range(0..self.places.len())];
        format!("{count}-{phonetic}-{star}-{place}")
    }
}

impl Default for WordLists {
    fn default() -> Self {
        let owned = |words: &[&str]| words.iter().map(ToString::to_string).collect();
        Self {
            counts: owned(COUNT_PREFIXES),
            phonetic: owned(PHONETIC),
            stars: owned(STARS),
            places: owned(PLACES),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_same_seed_same_label() {
        let words = WordLists::default();
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            assert_eq!(words.generate(&mut a), words.generate(&mut b));
        }
    }

    #[test]
    fn test_label_draws_in_fixed_order() {
        let words = WordLists::new(["di"], ["bravo"], ["vega"], ["paris"]).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(words.generate(&mut rng), "di-bravo-vega-paris");
    }

    #[test]
    fn test_label_segments_come_from_lists() {
        let words = WordLists::new(["a", "b"], ["c", "d"], ["e", "f"], ["g", "h"]).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..50 {
            let label = words.generate(&mut rng);
            let parts: Vec<&str> = label.split('-').collect();
            assert_eq!(parts.len(), 4);
            assert!(["a", "b"].contains(&parts[0]));
            assert!(["c", "d"].contains(&parts[1]));
            assert!(["e", "f"].contains(&parts[2]));
            assert!(["g", "h"].contains(&parts[3]));
        }
    }

    #[test]
    fn test_empty_list_rejected() {
        let empty: [&str; 0] = [];
        assert!(WordLists::new(["a"], ["b"], empty, ["c"]).is_none());
    }

    #[test]
    fn test_default_lists_are_large() {
        let words = WordLists::default();
        assert_eq!(COUNT_PREFIXES.len(), 29);
        assert_eq!(PHONETIC.len(), 26);
        assert_eq!(STARS.len(), 58);
        assert!(words.combinations() > 2_000_000);
    }
}
