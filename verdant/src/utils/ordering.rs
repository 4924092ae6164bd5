use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Orders a map by key when writing config files. Without it the same
/// config can be written in a different order on every run and show up
/// as a spurious change.
///
/// * `value`: `HashMap`
/// * `serializer`: Serializer
pub fn ordered_map<S, K, V>(value: &HashMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    K: Ord + Hash + Serialize,
    V: Serialize,
{
    let ordered: BTreeMap<_, _> = value.iter().collect();
    ordered.serialize(serializer)
}

#[cfg(test)]
mod tests {

    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Wrapper {
        #[serde(serialize_with = "ordered_map")]
        map: HashMap<u8, &'static str>,
    }

    #[test]
    fn test_map_is_written_in_key_order() {
        let map = (0..16u8).rev().map(|k| (k, "v")).collect();
        let yaml = serde_yaml::to_string(&Wrapper { map }).unwrap();
        let keys: Vec<u8> = yaml
            .lines()
            .skip(1)
            .map(|line| line.trim().split(':').next().unwrap().parse().unwrap())
            .collect();
        assert_eq!(keys, (0..16u8).collect::<Vec<_>>());
    }
}
