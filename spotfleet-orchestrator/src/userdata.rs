use regex::{Captures, Regex};
use spotfleet_common::{FleetError, PoolConfiguration};
use std::collections::BTreeMap;
use std::sync::OnceLock;

fn macro_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"@([A-Za-z_][A-Za-z0-9_]*)@").expect("valid macro regex"))
}

/// Expand `@NAME@` placeholders in a userdata template.
pub fn render(template: &str, macros: &BTreeMap<String, String>) -> Result<String, FleetError> {
    let mut missing = Vec::new();
    let rendered = macro_pattern().replace_all(template, |caps: &Captures| {
        let name = &caps[1];
        match macros.get(name) {
            Some(value) => value.clone(),
            None => {
                missing.push(name.to_string());
                caps[0].to_string()
            }
        }
    });

    if !missing.is_empty() {
        missing.sort();
        missing.dedup();
        return Err(FleetError::Config(format!(
            "userdata references undefined macro(s): {}",
            missing.join(", ")
        )));
    }
    if rendered.trim().is_empty() {
        return Err(FleetError::Config("userdata rendered to nothing".to_string()));
    }
    Ok(rendered.into_owned())
}

/// Userdata for a pool's instances, or None when the configuration has no template.
pub fn for_config(config: &PoolConfiguration) -> Result<Option<String>, FleetError> {
    config
        .userdata
        .as_deref()
        .map(|template| render(template, &config.userdata_macros))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn macros(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_every_occurrence() {
        let out = render(
            "#!/bin/sh\nexport POOL=@POOL@\necho @POOL@ @target_url@\n",
            &macros(&[("POOL", "fuzz"), ("target_url", "https://example.org")]),
        )
        .unwrap();
        assert_eq!(out, "#!/bin/sh\nexport POOL=fuzz\necho fuzz https://example.org\n");
    }

    #[test]
    fn leaves_plain_at_signs_alone() {
        let out = render("mail admin@example.org", &BTreeMap::new()).unwrap();
        assert_eq!(out, "mail admin@example.org");
    }

    #[test]
    fn undefined_macros_are_reported() {
        let err = render("@A@ @B@ @A@", &macros(&[("C", "x")])).unwrap_err();
        match err {
            FleetError::Config(msg) => assert!(msg.ends_with("A, B"), "{}", msg),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn empty_result_is_rejected() {
        assert!(render("@EMPTY@", &macros(&[("EMPTY", "  ")])).is_err());
    }
}
