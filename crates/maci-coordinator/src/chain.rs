//! chain name mapping between the frontend and the coordinator service

/// names whose backend identifier is not the kebab-case form
const BACKEND_OVERRIDES: &[(&str, &str)] = &[("polygon", "matic"), ("arbitrum", "arbitrum-one")];

/// `arbitrumSepolia` -> `arbitrum-sepolia`
pub fn camel_to_kebab_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    let mut prev: Option<char> = None;
    for c in s.chars() {
        if let Some(p) = prev {
            if c.is_ascii_uppercase() && (p.is_ascii_lowercase() || p.is_ascii_digit()) {
                out.push('-');
            }
        }
        out.push(c);
        prev = Some(c);
    }
    out.to_lowercase()
}

/// map a frontend chain name to the network identifier the coordinator expects
pub fn to_backend_chain_format(chain_name: &str) -> String {
    BACKEND_OVERRIDES
        .iter()
        .find(|(frontend, _)| *frontend == chain_name)
        .map(|(_, backend)| backend.to_string())
        .unwrap_or_else(|| camel_to_kebab_case(chain_name))
}
