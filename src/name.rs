//! Human readable, unguessable handles.
//!
//! A handle is an adjective, a noun and a random suffix of lowercase letters,
//! eg `quietotterxkqmvhbe`. The word pair keeps it readable, the suffix
//! carries most of the entropy (26^8, on top of the word pair).

use sodiumoxide::randombytes::randombytes_uniform;

const SUFFIX_LEN: usize = 8;

const ADJECTIVES: &[&str] = &[
    "amber", "ancient", "autumn", "bitter", "black", "blue", "bold", "brave", "brisk", "broken",
    "calm", "clever", "cold", "cool", "crimson", "curly", "damp", "dark", "dawn", "delicate",
    "divine", "dry", "eager", "empty", "falling", "fancy", "fierce", "floral", "fragrant",
    "frosty", "gentle", "green", "hidden", "holy", "icy", "jolly", "late", "lingering", "little",
    "lively", "long", "lucky", "misty", "morning", "muddy", "nameless", "noisy", "odd", "old",
    "orange", "patient", "plain", "polished", "proud", "purple", "quiet", "rapid", "raspy",
    "red", "restless", "rough", "round", "royal", "shiny", "shy", "silent", "small", "snowy",
    "soft", "solitary", "sparkling", "spring", "square", "steep", "still", "summer", "super",
    "sweet", "swift", "throbbing", "tight", "tiny", "twilight", "wandering", "weathered",
    "white", "wild", "winter", "wispy", "withered", "yellow", "young",
];

const NOUNS: &[&str] = &[
    "art", "band", "bar", "base", "bird", "block", "boat", "bonus", "bread", "breeze", "brook",
    "bush", "butterfly", "cake", "cell", "cherry", "cloud", "credit", "darkness", "dawn", "dew",
    "disk", "dream", "dust", "feather", "field", "fire", "firefly", "flower", "fog", "forest",
    "frog", "frost", "glade", "glitter", "grass", "hall", "hat", "haze", "heart", "hill",
    "king", "lab", "lake", "leaf", "limit", "math", "meadow", "mode", "moon", "morning",
    "mountain", "mouse", "mud", "night", "otter", "paper", "pine", "poetry", "pond", "queen",
    "rain", "recipe", "resonance", "rice", "river", "salad", "scene", "sea", "shadow", "shape",
    "silence", "sky", "smoke", "snow", "snowflake", "sound", "star", "sun", "sunset", "surf",
    "term", "thunder", "tooth", "tree", "truth", "union", "unit", "violet", "voice", "water",
    "waterfall", "wave", "wildflower", "wind", "wood",
];

/// Draws a fresh handle from libsodium's CSPRNG.
///
/// Uniqueness is not checked here, see [`crate::store::SecureStore::unique_name`].
pub fn generate() -> String {
    let adjective = pick(ADJECTIVES);
    let noun = pick(NOUNS);

    let mut name = String::with_capacity(adjective.len() + noun.len() + SUFFIX_LEN);
    name.push_str(adjective);
    name.push_str(noun);

    for _ in 0..SUFFIX_LEN {
        name.push((b'a' + randombytes_uniform(26) as u8) as char);
    }
    name
}

fn pick(words: &[&'static str]) -> &'static str {
    words[randombytes_uniform(words.len() as u32) as usize]
}
