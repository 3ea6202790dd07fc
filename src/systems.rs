//! Registry of well-known public water systems.
//!
//! Reference metadata for the large municipal systems the service ships
//! crosswalk data for: display name as it appears in the source CSVs, state,
//! and a short description of the service area. Ingestion uses it to fill
//! `state` and `notes` when the measurement file leaves them blank. It is
//! never a source of identity: systems are always keyed by the store.

/// Metadata for one water system.
pub struct KnownSystem {
    /// Display name, exactly as it appears in measurement and crosswalk files.
    pub name: &'static str,
    /// Two-letter USPS state code.
    pub state: &'static str,
    /// Human-readable service area.
    pub service_area: &'static str,
}

pub static SYSTEM_REGISTRY: &[KnownSystem] = &[
    KnownSystem {
        name: "New York City (DEP)",
        state: "NY",
        service_area: "All five boroughs of New York City.",
    },
    KnownSystem {
        name: "Los Angeles (LADWP)",
        state: "CA",
        service_area: "City of Los Angeles.",
    },
    KnownSystem {
        name: "Chicago",
        state: "IL",
        service_area: "City of Chicago.",
    },
    KnownSystem {
        name: "Philadelphia",
        state: "PA",
        service_area: "City of Philadelphia.",
    },
    KnownSystem {
        name: "San Diego (City of)",
        state: "CA",
        service_area: "City of San Diego.",
    },
    KnownSystem {
        name: "Dallas Water Utilities (DWU)",
        state: "TX",
        service_area: "City of Dallas.",
    },
    KnownSystem {
        name: "Phoenix",
        state: "AZ",
        service_area: "City of Phoenix.",
    },
    KnownSystem {
        name: "Baltimore City DPW",
        state: "MD",
        service_area: "Baltimore City.",
    },
    KnownSystem {
        name: "Houston",
        state: "TX",
        service_area: "City of Houston.",
    },
    KnownSystem {
        name: "San Antonio (SAWS)",
        state: "TX",
        service_area: "City of San Antonio.",
    },
    KnownSystem {
        name: "Miami-Dade",
        state: "FL",
        service_area: "Miami-Dade County.",
    },
    KnownSystem {
        name: "WSSC",
        state: "MD",
        service_area: "Montgomery and Prince George's counties.",
    },
    KnownSystem {
        name: "Las Vegas Valley Water District (LVVWD)",
        state: "NV",
        service_area: "Las Vegas, North Las Vegas, Henderson and the unincorporated \
                       Clark County towns of Paradise, Spring Valley, Enterprise, \
                       Sunrise Manor, Winchester and Whitney.",
    },
    KnownSystem {
        name: "EBMUD (East Bay MUD)",
        state: "CA",
        service_area: "Oakland, Berkeley, Alameda, Richmond, San Pablo, El Cerrito, \
                       Albany, Piedmont, Orinda, Moraga, Lafayette, Kensington and \
                       El Sobrante.",
    },
    KnownSystem {
        name: "MWRA (Full Service)",
        state: "MA",
        service_area: "Boston, Cambridge, Somerville, Newton, Brookline, Quincy, \
                       Malden, Medford, Chelsea, Everett, Revere, Watertown, \
                       Arlington, Belmont, Lexington, Milton and Dedham.",
    },
];

/// Looks up a system by exact display name. Returns `None` if not found.
pub fn find_system(name: &str) -> Option<&'static KnownSystem> {
    SYSTEM_REGISTRY.iter().find(|s| s.name == name)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_states_are_two_uppercase_letters() {
        // pws.state is CHAR(2); anything else would be padded or rejected.
        for system in SYSTEM_REGISTRY {
            assert_eq!(
                system.state.len(),
                2,
                "state for '{}' should be 2 letters, got '{}'",
                system.name,
                system.state
            );
            assert!(
                system.state.chars().all(|c| c.is_ascii_uppercase()),
                "state for '{}' should be uppercase, got '{}'",
                system.name,
                system.state
            );
        }
    }

    #[test]
    fn test_no_duplicate_names() {
        let mut seen = std::collections::HashSet::new();
        for system in SYSTEM_REGISTRY {
            assert!(
                seen.insert(system.name),
                "duplicate system name '{}' in SYSTEM_REGISTRY",
                system.name
            );
        }
    }

    #[test]
    fn test_find_system_is_exact_match() {
        let system = find_system("Baltimore City DPW").expect("Baltimore should be in registry");
        assert_eq!(system.state, "MD");
        // Names are case-sensitive join keys.
        assert!(find_system("baltimore city dpw").is_none());
        assert!(find_system("Springfield").is_none());
    }

    #[test]
    fn test_every_system_describes_its_service_area() {
        for system in SYSTEM_REGISTRY {
            assert!(
                !system.service_area.trim().is_empty(),
                "system '{}' needs a service area",
                system.name
            );
        }
    }
}
