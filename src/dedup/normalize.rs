// src/dedup/normalize.rs
// =============================================================================
// Address and locality identity keys.
//
//   "Avenida Paulista, nº 1.000 - Bela Vista" -> "av paulista 1000 bela vista"
//   ("São Paulo", "São Paulo")               -> "sao paulo|sp"
//   address key                               -> "av paulista 1000 bela vista|sao paulo|sp"
//
// Keys never contain '|' except as the separator, so the locality can be
// read back from an address key.
// =============================================================================

// Brazilian street types and their usual abbreviations (accent-folded)
const STREET_TYPES: &[(&str, &str)] = &[
    ("rua", "r"),
    ("avenida", "av"),
    ("travessa", "tv"),
    ("alameda", "al"),
    ("praca", "pc"),
    ("estrada", "estr"),
    ("rodovia", "rod"),
    ("largo", "lg"),
    ("viela", "vl"),
    ("servidao", "serv"),
];

// Words that only announce the street number
const NUMBER_WORDS: &[&str] = &["n", "no", "nr", "num", "numero"];

// Full state names folded to their two-letter code
const STATES: &[(&str, &str)] = &[
    ("acre", "ac"),
    ("alagoas", "al"),
    ("amapa", "ap"),
    ("amazonas", "am"),
    ("bahia", "ba"),
    ("ceara", "ce"),
    ("distrito federal", "df"),
    ("espirito santo", "es"),
    ("goias", "go"),
    ("maranhao", "ma"),
    ("mato grosso", "mt"),
    ("mato grosso do sul", "ms"),
    ("minas gerais", "mg"),
    ("para", "pa"),
    ("paraiba", "pb"),
    ("parana", "pr"),
    ("pernambuco", "pe"),
    ("piaui", "pi"),
    ("rio de janeiro", "rj"),
    ("rio grande do norte", "rn"),
    ("rio grande do sul", "rs"),
    ("rondonia", "ro"),
    ("roraima", "rr"),
    ("santa catarina", "sc"),
    ("sao paulo", "sp"),
    ("sergipe", "se"),
    ("tocantins", "to"),
];

pub fn fold_accents(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ã' | 'ä' | 'Á' | 'À' | 'Â' | 'Ã' | 'Ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' | 'É' | 'È' | 'Ê' | 'Ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' | 'Í' | 'Ì' | 'Î' | 'Ï' => 'i',
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' | 'Ó' | 'Ò' | 'Ô' | 'Õ' | 'Ö' => 'o',
            'ú' | 'ù' | 'û' | 'ü' | 'Ú' | 'Ù' | 'Û' | 'Ü' => 'u',
            'ç' | 'Ç' => 'c',
            'ñ' | 'Ñ' => 'n',
            other => other,
        })
        .collect()
}

// Lowercase, fold accents, turn punctuation into spaces. Dots and commas
// between digits are dropped so "1.000" stays one number.
fn simplify(text: &str) -> Vec<String> {
    let folded = fold_accents(text).to_lowercase();
    let chars: Vec<char> = folded.chars().collect();
    let mut cleaned = String::with_capacity(folded.len());

    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii_alphanumeric() {
            cleaned.push(c);
        } else if matches!(c, '.' | ',')
            && i > 0
            && chars[i - 1].is_ascii_digit()
            && chars.get(i + 1).map_or(false, char::is_ascii_digit)
        {
            continue;
        } else {
            cleaned.push(' ');
        }
    }

    cleaned.split_whitespace().map(str::to_string).collect()
}

/// Normalized street address, or None when nothing identifying is left.
pub fn normalize_address(address: &str) -> Option<String> {
    let tokens = simplify(address);
    let mut out: Vec<&str> = Vec::with_capacity(tokens.len());

    for (i, token) in tokens.iter().enumerate() {
        let next_is_number = tokens
            .get(i + 1)
            .map_or(false, |t| t.starts_with(|c: char| c.is_ascii_digit()));
        if NUMBER_WORDS.contains(&token.as_str()) && next_is_number {
            continue;
        }
        let abbreviated = STREET_TYPES
            .iter()
            .find(|(full, _)| full == token)
            .map_or(token.as_str(), |(_, short)| short);
        out.push(abbreviated);
    }

    (!out.is_empty()).then(|| out.join(" "))
}

fn normalize_place(text: &str) -> Option<String> {
    let joined = simplify(text).join(" ");
    (!joined.is_empty()).then_some(joined)
}

pub fn normalize_state(state: &str) -> Option<String> {
    let place = normalize_place(state)?;
    Some(
        STATES
            .iter()
            .find(|(name, _)| *name == place)
            .map_or(place, |(_, code)| code.to_string()),
    )
}

/// "city|state", or None without a city. A missing state leaves the part
/// after the separator empty.
pub fn locality_key(city: Option<&str>, state: Option<&str>) -> Option<String> {
    let city = normalize_place(city?)?;
    let state = state.and_then(normalize_state).unwrap_or_default();
    Some(format!("{}|{}", city, state))
}

/// "address|city|state", or None without an address or a city.
pub fn address_key(address: Option<&str>, city: Option<&str>, state: Option<&str>) -> Option<String> {
    let address = normalize_address(address?)?;
    let locality = locality_key(city, state)?;
    Some(format!("{}|{}", address, locality))
}

/// Address part of an address key.
pub fn address_part(address_key: &str) -> &str {
    address_key.split_once('|').map_or(address_key, |(address, _)| address)
}
