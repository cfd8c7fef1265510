/// Known platform collections and name resolution

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
  pub name: &'static str,
  pub aliases: &'static [&'static str],
  pub description: &'static str,
}

/// All collections served by the platform API
pub const COLLECTIONS: &[Collection] = &[
  Collection {
    name: "edges",
    aliases: &["e", "edge", "gateways"],
    description: "Edge gateways",
  },
  Collection {
    name: "edge-types",
    aliases: &["et", "edge-type", "edgetypes"],
    description: "Edge hardware and firmware types",
  },
  Collection {
    name: "locations",
    aliases: &["l", "location", "sites"],
    description: "Physical locations",
  },
  Collection {
    name: "location-types",
    aliases: &["lt", "location-type", "locationtypes"],
    description: "Location categories",
  },
  Collection {
    name: "things",
    aliases: &["t", "thing", "devices"],
    description: "Connected devices",
  },
  Collection {
    name: "thing-types",
    aliases: &["tt", "thing-type", "thingtypes"],
    description: "Device models",
  },
  Collection {
    name: "clients",
    aliases: &["c", "client", "tenants"],
    description: "Client accounts",
  },
];

/// Map a name or alias to its canonical collection
pub fn resolve(input: &str) -> Option<&'static Collection> {
  let input_lower = input.trim().to_lowercase();
  COLLECTIONS
    .iter()
    .find(|c| c.name == input_lower || c.aliases.contains(&input_lower.as_str()))
}

/// Ranked matches for a partial or mistyped collection name
pub fn suggestions(input: &str) -> Vec<&'static Collection> {
  let input_lower = input.trim().to_lowercase();

  if input_lower.is_empty() {
    return COLLECTIONS.iter().collect();
  }

  let mut matches: Vec<(&Collection, u32)> = Vec::new();

  for collection in COLLECTIONS {
    let priority = if collection.name == input_lower {
      0
    } else if collection.aliases.contains(&input_lower.as_str()) {
      1
    } else if collection.name.starts_with(&input_lower) {
      2
    } else if collection.aliases.iter().any(|a| a.starts_with(&input_lower)) {
      3
    } else if collection.name.contains(&input_lower) {
      4
    } else if collection.aliases.iter().any(|a| a.contains(&input_lower)) {
      5
    } else {
      continue;
    };
    matches.push((collection, priority));
  }

  // Stable sort keeps catalogue order within a priority
  matches.sort_by_key(|(_, priority)| *priority);

  matches.into_iter().map(|(c, _)| c).collect()
}
