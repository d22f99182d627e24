use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::info;
use serde_json::{Map, Value, json};

use crate::errors::ParamError;

/// Flat parameter map keyed by dotted names ("player_goal_init.gk").
pub type FlatParams = BTreeMap<String, f64>;

const FLATTEN_KEY: char = '.';
const SIG_FIGS: usize = 5;

/// Parameter categories: acronym prefix matched against parameter names, and
/// the file the category lives in. A parameter matching zero or several
/// acronyms is a load/save-time error, never silently resolved.
const CATEGORIES: [(&str, &str); 3] = [
    ("team", "team_kf_params"),
    ("league", "league_kf_params"),
    ("player", "player_kf_params"),
];

/// Converts a two-level nested mapping into a flat dotted-key mapping.
/// Anything nested deeper than two levels is rejected.
pub fn flatten_params(nested: &Map<String, Value>) -> Result<FlatParams, ParamError> {
    let mut out = FlatParams::new();
    for (key, value) in nested {
        match value {
            Value::Object(inner) => {
                for (sub_key, sub_value) in inner {
                    if sub_value.is_object() {
                        return Err(ParamError::TooDeep(format!("{key}{FLATTEN_KEY}{sub_key}")));
                    }
                    let flat_key = format!("{key}{FLATTEN_KEY}{sub_key}");
                    let number = numeric(&flat_key, sub_value)?;
                    out.insert(flat_key, number);
                }
            }
            _ => {
                out.insert(key.clone(), numeric(key, value)?);
            }
        }
    }
    Ok(out)
}

/// Exact inverse of [`flatten_params`] for maps it produced.
pub fn unflatten_params(flat: &FlatParams) -> Result<Map<String, Value>, ParamError> {
    let mut out = Map::new();
    for (key, value) in flat {
        if key.contains(FLATTEN_KEY) {
            let mut split = key.split(FLATTEN_KEY);
            let (Some(outer), Some(inner), None) = (split.next(), split.next(), split.next())
            else {
                return Err(ParamError::BadKey(key.clone()));
            };
            let entry = out
                .entry(outer.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            let Value::Object(group) = entry else {
                return Err(ParamError::BadKey(key.clone()));
            };
            group.insert(inner.to_string(), json!(value));
        } else {
            out.insert(key.clone(), json!(value));
        }
    }
    Ok(out)
}

fn numeric(key: &str, value: &Value) -> Result<f64, ParamError> {
    value
        .as_f64()
        .ok_or_else(|| ParamError::NotNumeric(key.to_string()))
}

fn default_category(acronym: &str) -> Map<String, Value> {
    let defaults = match acronym {
        "team" => json!({
            "team_home_att_init_sd": 0.24817,
            "team_home_def_init_sd": 0.21934,
            "team_away_att_init_sd": 0.26605,
            "team_away_def_init_sd": 0.23411,
            "team_process_sd": 0.041268
        }),
        "league" => json!({
            "league_home_init": 1.3602,
            "league_away_init": 1.0915,
            "league_home_init_sd": 0.19773,
            "league_away_init_sd": 0.18349,
            "league_process_sd": 0.024596
        }),
        "player" => json!({
            "player_goal_init": {
                "gk": 0.0012744,
                "def": 0.043128,
                "mid": 0.098099,
                "fwd": 0.18767
            },
            "player_goal_init_sd": 0.091535,
            "player_goal_process_sd": 0.017468,
            "player_assist_init": {
                "gk": 0.0035161,
                "def": 0.062412,
                "mid": 0.12527,
                "fwd": 0.13762
            },
            "player_assist_init_sd": 0.088691,
            "player_assist_process_sd": 0.015992
        }),
        other => panic!("unknown parameter category {other}"),
    };
    let Value::Object(map) = defaults else {
        unreachable!()
    };
    map
}

/// Loads every category file from `dir`, falling back to the built-in
/// defaults for categories whose file is missing. Keys prefixed with '_' are
/// file metadata and skipped. A parameter appearing in two files is fatal.
pub fn load_params(dir: &Path) -> Result<FlatParams, ParamError> {
    let mut merged = FlatParams::new();
    for (acronym, stem) in CATEGORIES {
        let path = dir.join(format!("{stem}.json"));
        let nested = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            let value: Value = serde_json::from_str(&raw)?;
            let Value::Object(mut map) = value else {
                return Err(ParamError::BadFile(stem.to_string()));
            };
            map.retain(|key, _| !key.starts_with('_'));
            map
        } else {
            default_category(acronym)
        };
        for (key, value) in flatten_params(&nested)? {
            if merged.contains_key(&key) {
                return Err(ParamError::Duplicate(key));
            }
            merged.insert(key, value);
        }
    }
    Ok(merged)
}

/// Splits a flat parameter map into per-category maps by acronym prefix.
fn ramify_params(flat: &FlatParams) -> Result<BTreeMap<&'static str, FlatParams>, ParamError> {
    let mut out: BTreeMap<&'static str, FlatParams> = BTreeMap::new();
    for (key, value) in flat {
        let mut matched = None;
        for (acronym, stem) in CATEGORIES {
            if key.starts_with(acronym) {
                if matched.is_some() {
                    return Err(ParamError::AmbiguousAcronym(key.clone()));
                }
                matched = Some(stem);
            }
        }
        let Some(stem) = matched else {
            return Err(ParamError::UnmatchedAcronym(key.clone()));
        };
        out.entry(stem).or_default().insert(key.clone(), *value);
    }
    Ok(out)
}

/// Writes every category to its file under `dir`, values rounded to five
/// significant figures, atomically (tmp file then rename).
pub fn save_params(dir: &Path, flat: &FlatParams) -> Result<(), ParamError> {
    fs::create_dir_all(dir)?;
    let generated_at = chrono::Utc::now().to_rfc3339();
    for (stem, category) in ramify_params(flat)? {
        let nested = unflatten_params(&category)?;
        let mut body = String::from("{\n");
        body.push_str(&format!("  \"_generated_at\": \"{generated_at}\",\n"));
        let last = nested.len().saturating_sub(1);
        for (idx, (key, value)) in nested.iter().enumerate() {
            let comma = if idx == last { "" } else { "," };
            match value {
                Value::Object(group) => {
                    body.push_str(&format!("  \"{key}\": {{\n"));
                    let group_last = group.len().saturating_sub(1);
                    for (group_idx, (sub_key, sub_value)) in group.iter().enumerate() {
                        let group_comma = if group_idx == group_last { "" } else { "," };
                        let number = numeric(sub_key, sub_value)?;
                        body.push_str(&format!(
                            "    \"{sub_key}\": {}{group_comma}\n",
                            format_sig_figs(number, SIG_FIGS)
                        ));
                    }
                    body.push_str(&format!("  }}{comma}\n"));
                }
                _ => {
                    let number = numeric(key, value)?;
                    body.push_str(&format!(
                        "  \"{key}\": {}{comma}\n",
                        format_sig_figs(number, SIG_FIGS)
                    ));
                }
            }
        }
        body.push_str("}\n");

        let path = dir.join(format!("{stem}.json"));
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &path)?;
    }
    Ok(())
}

/// Fixed-significant-figure decimal rendering, exponent notation outside the
/// plain-decimal range (mirrors printf %g).
pub fn format_sig_figs(value: f64, sig_figs: usize) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    let sig = sig_figs.max(1) as i32;
    let exponent = value.abs().log10().floor() as i32;
    if exponent < -4 || exponent >= sig {
        format!("{:.*e}", (sig - 1) as usize, value)
    } else {
        let decimals = (sig - 1 - exponent).max(0) as usize;
        let rendered = format!("{value:.decimals$}");
        if rendered.contains('.') {
            rendered
                .trim_end_matches('0')
                .trim_end_matches('.')
                .to_string()
        } else {
            rendered
        }
    }
}

/// Box bounds for a parameter. Spreads and rate-type initial means must stay
/// strictly positive; anything else is unbounded.
pub fn bounds_for(name: &str) -> (Option<f64>, Option<f64>) {
    if name.ends_with("_sd") || name.contains("_init") {
        (Some(1e-7), None)
    } else {
        (None, None)
    }
}

const ABBREVIATIONS: [(&str, &str); 8] = [
    ("team_", "tm_"),
    ("league_", "lg_"),
    ("player_", "pl_"),
    ("goal_", "gl_"),
    ("assist_", "as_"),
    ("home_", "h_"),
    ("away_", "a_"),
    ("process_", "q_"),
];

fn abbreviate(name: &str) -> String {
    let mut out = name.to_string();
    for (long, short) in ABBREVIATIONS {
        out = out.replace(long, short);
    }
    out
}

/// The parameter view a tuner works on: the subset of the full parameter map
/// it is allowed to touch, partitioned into fixed and optimizable names.
#[derive(Debug, Clone)]
pub struct TunerParams {
    names: Vec<String>,
    fixed: Vec<String>,
    optimise: Vec<String>,
    values: FlatParams,
}

impl TunerParams {
    /// Validates `fixed`/`only_do` against the tuner's parameter list and
    /// pulls initial values out of `all_params`. Supplying both `fixed` and
    /// `only_do` is fatal here, before any backtest runs; a non-empty
    /// `only_do` turns its complement into the fixed set.
    pub fn new(
        all_params: &FlatParams,
        init_names: &[&str],
        fixed: &[String],
        only_do: &[String],
    ) -> Result<Self, ParamError> {
        for name in fixed.iter().chain(only_do) {
            if !init_names.contains(&name.as_str()) {
                return Err(ParamError::Unknown(name.clone()));
            }
        }
        if !only_do.is_empty() && !fixed.is_empty() {
            return Err(ParamError::FixedAndOnlyDo);
        }

        let fixed: Vec<String> = if only_do.is_empty() {
            fixed.to_vec()
        } else {
            init_names
                .iter()
                .filter(|name| !only_do.iter().any(|o| o == *name))
                .map(|name| name.to_string())
                .collect()
        };
        let optimise: Vec<String> = init_names
            .iter()
            .filter(|name| !fixed.iter().any(|f| f == *name))
            .map(|name| name.to_string())
            .collect();
        if optimise.is_empty() {
            return Err(ParamError::NothingToOptimise);
        }

        let mut values = FlatParams::new();
        for name in init_names {
            let value = all_params
                .get(*name)
                .copied()
                .ok_or_else(|| ParamError::Missing(name.to_string()))?;
            values.insert(name.to_string(), value);
        }

        Ok(Self {
            names: init_names.iter().map(|n| n.to_string()).collect(),
            fixed,
            optimise,
            values,
        })
    }

    pub fn fixed_names(&self) -> &[String] {
        &self.fixed
    }

    pub fn optimise_names(&self) -> &[String] {
        &self.optimise
    }

    pub fn values(&self) -> &FlatParams {
        &self.values
    }

    /// Initial vector for the optimizer, ordered like `optimise_names`.
    pub fn x0(&self) -> Vec<f64> {
        self.optimise
            .iter()
            .map(|name| self.values[name])
            .collect()
    }

    /// Writes an optimizer vector back into the optimizable entries.
    pub fn update_from_vector(&mut self, vector: &[f64]) {
        for (name, value) in self.optimise.iter().zip(vector) {
            self.values.insert(name.clone(), *value);
        }
    }

    /// Bounds in optimizable order.
    pub fn optimise_bounds(&self) -> Vec<(Option<f64>, Option<f64>)> {
        self.optimise.iter().map(|name| bounds_for(name)).collect()
    }

    /// The full parameter map with this tuner's current values layered on top.
    pub fn overlay(&self, all_params: &FlatParams) -> FlatParams {
        let mut out = all_params.clone();
        for (key, value) in &self.values {
            out.insert(key.clone(), *value);
        }
        out
    }

    /// Nested rendering of the tuner's current values.
    pub fn nested(&self) -> Result<Map<String, Value>, ParamError> {
        unflatten_params(&self.values)
    }

    /// Header row of the tuning log: abbreviated names, fixed ones annotated.
    pub fn log_header(&self) {
        info!("out of possible parameters: {:?}", self.names);
        info!("keeping the following fixed: {:?}", self.fixed);
        let mut header = String::new();
        for name in &self.names {
            let mut label = abbreviate(name);
            if self.fixed.iter().any(|f| f == name) {
                label.push_str(" (f)");
            }
            header.push_str(&format!("{label:>22}"));
        }
        header.push_str(&format!("{:>18}", "l'hood"));
        info!("");
        info!("{header}");
    }

    /// One row per evaluation: every parameter value, then the likelihood and
    /// any penalty annotation.
    pub fn log_row(&self, likelihood: f64, pen_str: &str) {
        let mut row = String::new();
        for name in &self.names {
            row.push_str(&format!("{:>22}", format_sig_figs(self.values[name], 4)));
        }
        row.push_str(&format!("{likelihood:>18.7}"));
        row.push_str(pen_str);
        info!("{row}");
    }

    /// Pretty-printed nested dump, used when a parameter set fails or at the
    /// end of a run.
    pub fn log_output(&self) {
        match self.nested().and_then(|nested| {
            serde_json::to_string_pretty(&Value::Object(nested)).map_err(ParamError::from)
        }) {
            Ok(pretty) => info!("{pretty}"),
            Err(err) => info!("unable to render parameters: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nested_fixture() -> Map<String, Value> {
        let Value::Object(map) = json!({
            "team_process_sd": 0.05,
            "player_goal_init": {"gk": 0.001, "fwd": 0.2}
        }) else {
            unreachable!()
        };
        map
    }

    #[test]
    fn flatten_then_unflatten_round_trips() {
        let nested = nested_fixture();
        let flat = flatten_params(&nested).unwrap();
        assert_eq!(flat["team_process_sd"], 0.05);
        assert_eq!(flat["player_goal_init.gk"], 0.001);
        let back = unflatten_params(&flat).unwrap();
        assert_eq!(Value::Object(back), Value::Object(nested));
    }

    #[test]
    fn triple_nesting_is_rejected() {
        let Value::Object(map) = json!({"a": {"b": {"c": 1.0}}}) else {
            unreachable!()
        };
        assert!(matches!(
            flatten_params(&map),
            Err(ParamError::TooDeep(key)) if key == "a.b"
        ));
    }

    #[test]
    fn non_numeric_leaf_is_rejected() {
        let Value::Object(map) = json!({"a": "not a number"}) else {
            unreachable!()
        };
        assert!(matches!(flatten_params(&map), Err(ParamError::NotNumeric(_))));
    }

    #[test]
    fn defaults_load_when_files_are_missing() {
        let params = load_params(Path::new("/nonexistent/params/dir")).unwrap();
        assert!(params.contains_key("team_process_sd"));
        assert!(params.contains_key("league_home_init"));
        assert!(params.contains_key("player_assist_init.mid"));
    }

    #[test]
    fn ramify_rejects_unmatched_names() {
        let mut flat = FlatParams::new();
        flat.insert("goalie_mystery_param".to_string(), 1.0);
        assert!(matches!(
            ramify_params(&flat),
            Err(ParamError::UnmatchedAcronym(_))
        ));
    }

    #[test]
    fn save_then_load_round_trips_at_five_sig_figs() {
        let dir = std::env::temp_dir().join(format!("fpl_params_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        let mut params = load_params(&dir).unwrap();
        params.insert("team_process_sd".to_string(), 0.0412684321);
        save_params(&dir, &params).unwrap();
        let reloaded = load_params(&dir).unwrap();
        assert_eq!(reloaded["team_process_sd"], 0.041268);
        assert_eq!(
            reloaded["player_goal_init.fwd"],
            params["player_goal_init.fwd"]
        );
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn sig_fig_rendering() {
        assert_eq!(format_sig_figs(0.0412684321, 5), "0.041268");
        assert_eq!(format_sig_figs(1.3602, 5), "1.3602");
        assert_eq!(format_sig_figs(0.0, 5), "0");
        assert_eq!(format_sig_figs(123456.0, 5), "1.2346e5");
        assert_eq!(format_sig_figs(2.5e-7, 5), "2.5000e-7");
    }

    #[test]
    fn fixed_and_only_do_are_mutually_exclusive() {
        let all = load_params(Path::new("/nonexistent")).unwrap();
        let names = ["team_process_sd", "team_home_att_init_sd"];
        let err = TunerParams::new(
            &all,
            &names,
            &["team_process_sd".to_string()],
            &["team_home_att_init_sd".to_string()],
        )
        .unwrap_err();
        assert!(matches!(err, ParamError::FixedAndOnlyDo));
    }

    #[test]
    fn only_do_complement_becomes_the_fixed_set() {
        let all = load_params(Path::new("/nonexistent")).unwrap();
        let names = [
            "team_process_sd",
            "team_home_att_init_sd",
            "team_away_att_init_sd",
        ];
        let params =
            TunerParams::new(&all, &names, &[], &["team_home_att_init_sd".to_string()]).unwrap();
        assert_eq!(params.optimise_names(), ["team_home_att_init_sd"]);
        assert_eq!(
            params.fixed_names(),
            ["team_process_sd", "team_away_att_init_sd"]
        );
    }

    #[test]
    fn all_fixed_is_rejected() {
        let all = load_params(Path::new("/nonexistent")).unwrap();
        let names = ["team_process_sd"];
        let err =
            TunerParams::new(&all, &names, &["team_process_sd".to_string()], &[]).unwrap_err();
        assert!(matches!(err, ParamError::NothingToOptimise));
    }

    #[test]
    fn unknown_fixed_name_is_rejected() {
        let all = load_params(Path::new("/nonexistent")).unwrap();
        let names = ["team_process_sd"];
        let err = TunerParams::new(&all, &names, &["no_such_param".to_string()], &[]).unwrap_err();
        assert!(matches!(err, ParamError::Unknown(_)));
    }

    #[test]
    fn spread_and_mean_parameters_are_bounded_strictly_positive() {
        assert_eq!(bounds_for("team_process_sd"), (Some(1e-7), None));
        assert_eq!(bounds_for("league_home_init"), (Some(1e-7), None));
        assert_eq!(bounds_for("player_goal_init.gk"), (Some(1e-7), None));

        let all = load_params(Path::new("/nonexistent")).unwrap();
        let names = ["team_process_sd", "league_home_init"];
        let params = TunerParams::new(&all, &names, &[], &[]).unwrap();
        assert_eq!(params.optimise_bounds().len(), 2);
        assert!(params.optimise_bounds().iter().all(|b| *b == (Some(1e-7), None)));
    }

    #[test]
    fn update_from_vector_only_touches_optimise_entries() {
        let all = load_params(Path::new("/nonexistent")).unwrap();
        let names = ["team_process_sd", "team_home_att_init_sd"];
        let mut params =
            TunerParams::new(&all, &names, &["team_home_att_init_sd".to_string()], &[]).unwrap();
        let before_fixed = params.values()["team_home_att_init_sd"];
        params.update_from_vector(&[0.5]);
        assert_eq!(params.values()["team_process_sd"], 0.5);
        assert_eq!(params.values()["team_home_att_init_sd"], before_fixed);
    }
}
