//! Built-in energy-storage workers
//!
//! - `bms_unit`: one battery, driven by `commands.command` / `commands.powerRequest`
//! - `bms_master`: fans out `num_units` battery units below itself
//! - `ess_master`: rolls up capacity and power of its `bms/*` children

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::store::{child_map, last_segment};
use crate::worker::{WorkerContext, WorkerRegistry};

pub const BMS_UNIT: &str = "bms_unit";
pub const BMS_MASTER: &str = "bms_master";
pub const ESS_MASTER: &str = "ess_master";

const DEFAULT_CAPACITY: i64 = 40000;
const DEFAULT_MAX_POWER: i64 = 400;
/// Upper bound on units a single `bms_master` starts
pub const MAX_UNITS: i64 = 256;

/// Register every built-in worker type
pub fn register(registry: &WorkerRegistry) {
    registry.register_with_init(BMS_UNIT, seed_unit, bms_unit);
    registry.register_with_init(BMS_MASTER, seed_bms_master, bms_master);
    registry.register_with_init(ESS_MASTER, seed_ess_master, ess_master);
}

fn int(map: &Map<String, Value>, key: &str) -> Option<i64> {
    map.get(key).and_then(Value::as_i64)
}

fn text<'a>(map: &'a Map<String, Value>, key: &str) -> &'a str {
    map.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn bump_count(map: &mut Map<String, Value>) -> i64 {
    let count = int(map, "count").unwrap_or(0) + 1;
    map.insert("count".into(), json!(count));
    count
}

/// Fill in every conventional field a battery unit needs, keeping
/// anything the `run` body already supplied.
pub fn init_unit(map: &mut Map<String, Value>, name: &str, uri: &str) {
    map.insert("name".into(), json!(name));
    map.insert("uri".into(), json!(uri));
    map.entry("max_capacity").or_insert(json!(DEFAULT_CAPACITY));
    map.entry("maxpower").or_insert(json!(DEFAULT_MAX_POWER));
    map.entry("count").or_insert(json!(0));

    let status = child_map(map, "status");
    status.entry("state").or_insert(json!("off"));
    status.entry("SOC").or_insert(json!(100));
    status.entry("capacity").or_insert(json!(DEFAULT_CAPACITY));
    status.entry("power").or_insert(json!(0));

    let commands = child_map(map, "commands");
    commands.entry("command").or_insert(json!("off"));
    commands.entry("powerRequest").or_insert(json!(0));
}

fn seed_unit(map: &mut Map<String, Value>, uri: &str) {
    init_unit(map, &last_segment(uri), uri);
}

fn seed_master(map: &mut Map<String, Value>, uri: &str) {
    map.insert("name".into(), json!(last_segment(uri)));
    map.insert("uri".into(), json!(uri));
    map.entry("count").or_insert(json!(0));
}

fn seed_bms_master(map: &mut Map<String, Value>, uri: &str) {
    seed_master(map, uri);
    child_map(map, "bms");
}

fn seed_ess_master(map: &mut Map<String, Value>, uri: &str) {
    seed_master(map, uri);
    child_map(map, "status");
}

/// `num_units` from the node, within `0..=MAX_UNITS`
pub fn unit_count(map: &Map<String, Value>) -> i64 {
    let requested = int(map, "num_units").unwrap_or(0);
    if requested > MAX_UNITS {
        warn!(requested, max = MAX_UNITS, "num_units capped");
    }
    requested.clamp(0, MAX_UNITS)
}

/// Snapshot after one unit cycle
#[derive(Debug, Clone, PartialEq)]
pub struct UnitStep {
    pub state: String,
    pub capacity: i64,
    pub power: i64,
    pub count: i64,
}

/// One battery cycle: apply the command, then integrate the power request
pub fn step_unit(map: &mut Map<String, Value>) -> UnitStep {
    let count = bump_count(map);
    let max_capacity = int(map, "max_capacity").unwrap_or(DEFAULT_CAPACITY);
    let max_power = int(map, "maxpower").unwrap_or(DEFAULT_MAX_POWER).abs();

    let (command, request) = {
        let commands = child_map(map, "commands");
        (
            text(commands, "command").to_string(),
            int(commands, "powerRequest").unwrap_or(0),
        )
    };
    let request = request.clamp(-max_power, max_power);

    let status = child_map(map, "status");
    let mut state = text(status, "state").to_string();
    let capacity = int(status, "capacity").unwrap_or(max_capacity);

    let transition = match (state.as_str(), command.as_str()) {
        ("off" | "charge" | "discharge", "standby") => Some("standby".to_string()),
        ("standby", "charge" | "discharge" | "off") => Some(command.clone()),
        _ => None,
    };
    if let Some(next_state) = transition {
        state = next_state;
    }

    let next = match state.as_str() {
        "charge" if request > 0 && capacity < max_capacity => {
            (capacity + request).min(max_capacity)
        }
        "discharge" if request < 0 && capacity > 0 => (capacity + request).max(0),
        _ => capacity,
    };
    let power = next - capacity;
    let soc = if max_capacity > 0 {
        next * 100 / max_capacity
    } else {
        0
    };

    status.insert("state".into(), json!(state));
    status.insert("capacity".into(), json!(next));
    status.insert("power".into(), json!(power));
    status.insert("SOC".into(), json!(soc));

    UnitStep {
        state,
        capacity: next,
        power,
        count,
    }
}

/// Battery unit worker
pub async fn bms_unit(ctx: WorkerContext) -> anyhow::Result<()> {
    let name = ctx.name();
    let ticker = ctx.ticker()?;
    loop {
        ticker.tick().await;
        let step = ctx.update(step_unit);
        debug!(
            unit = %name,
            state = %step.state,
            capacity = step.capacity,
            "bms_unit cycle"
        );
    }
}

/// Starts `num_units` battery units at `<uri>/bms/bms_<i>`
pub async fn bms_master(ctx: WorkerContext) -> anyhow::Result<()> {
    let name = ctx.name();
    let units = ctx.update(|map| unit_count(map));

    for i in 0..units {
        if let Err(e) = ctx.spawn_child(BMS_UNIT, &format!("bms/bms_{}", i)) {
            warn!(master = %name, "bms_master could not start unit {}: {}", i, e);
        }
    }

    let ticker = ctx.ticker()?;
    loop {
        ticker.tick().await;
        let count = ctx.update(bump_count);
        debug!(master = %name, count, "bms_master cycle");
    }
}

/// Sum `capacity`, `max_capacity` and `power` over `bms/*` and publish
/// the totals in this node's `status`
pub fn rollup(map: &mut Map<String, Value>) -> (i64, i64) {
    let mut capacity = 0;
    let mut max_capacity = 0;
    let mut power = 0;
    let mut units = 0;

    if let Some(Value::Object(bms)) = map.get("bms") {
        for unit in bms.values().filter_map(Value::as_object) {
            let Some(Value::Object(status)) = unit.get("status") else {
                continue;
            };
            capacity += int(status, "capacity").unwrap_or(0);
            power += int(status, "power").unwrap_or(0);
            max_capacity += int(unit, "max_capacity").unwrap_or(0);
            units += 1;
        }
    }

    let status = child_map(map, "status");
    status.insert("units".into(), json!(units));
    status.insert("capacity".into(), json!(capacity));
    status.insert("max_capacity".into(), json!(max_capacity));
    status.insert("power".into(), json!(power));
    if max_capacity > 0 {
        status.insert("SOC".into(), json!(capacity * 100 / max_capacity));
    }
    (capacity, power)
}

/// Energy storage system master
pub async fn ess_master(ctx: WorkerContext) -> anyhow::Result<()> {
    let name = ctx.name();
    let ticker = ctx.ticker()?;
    loop {
        ticker.tick().await;
        let (capacity, power) = ctx.update(|map| {
            bump_count(map);
            rollup(map)
        });
        debug!(ess = %name, capacity, power, "ess_master cycle");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::timer::TimerEngine;
    use crate::worker::Mesh;
    use std::sync::Arc;
    use std::time::Duration;

    fn unit() -> Map<String, Value> {
        let mut map = Map::new();
        init_unit(&mut map, "bms_2", "/mysys/ess/ess_1/bms/bms_2");
        map
    }

    fn command(map: &mut Map<String, Value>, command: &str, request: i64) {
        let commands = child_map(map, "commands");
        commands.insert("command".into(), json!(command));
        commands.insert("powerRequest".into(), json!(request));
    }

    #[test]
    fn test_init_unit_fields() {
        let map = Value::Object(unit());
        assert_eq!(map["name"], "bms_2");
        assert_eq!(map["status"]["state"], "off");
        assert_eq!(map["commands"]["command"], "off");
        assert_eq!(map["status"]["SOC"], 100);
        assert_eq!(map["max_capacity"], 40000);
    }

    #[test]
    fn test_init_keeps_supplied_fields() {
        let mut map = Map::new();
        map.insert("max_capacity".into(), json!(1000));
        map.insert("status".into(), json!({"capacity": 500}));
        init_unit(&mut map, "u", "/u");
        assert_eq!(map["max_capacity"], 1000);
        assert_eq!(map["status"]["capacity"], 500);
        assert_eq!(map["status"]["state"], "off");
    }

    #[test]
    fn test_off_ignores_charge_until_standby() {
        let mut map = unit();
        command(&mut map, "charge", 100);
        assert_eq!(step_unit(&mut map).state, "off");

        command(&mut map, "standby", 0);
        assert_eq!(step_unit(&mut map).state, "standby");

        command(&mut map, "charge", 100);
        assert_eq!(step_unit(&mut map).state, "charge");
    }

    #[test]
    fn test_discharge_clamps_request_and_updates_soc() {
        let mut map = unit();
        command(&mut map, "standby", 0);
        step_unit(&mut map);
        command(&mut map, "discharge", -10_000);

        let step = step_unit(&mut map);
        assert_eq!(step.state, "discharge");
        assert_eq!(step.power, -400);
        assert_eq!(step.capacity, 39600);
        assert_eq!(map["status"]["SOC"], 99);
        assert_eq!(step.count, 2);
    }

    #[test]
    fn test_charge_stops_at_max_capacity() {
        let mut map = unit();
        command(&mut map, "standby", 0);
        step_unit(&mut map);
        command(&mut map, "charge", 400);

        let step = step_unit(&mut map);
        assert_eq!(step.capacity, 40000);
        assert_eq!(step.power, 0);
    }

    #[test]
    fn test_rollup_sums_children() {
        let mut map = Map::new();
        map.insert(
            "bms".into(),
            json!({
                "bms_0": {"max_capacity": 100, "status": {"capacity": 50, "power": 5}},
                "bms_1": {"max_capacity": 100, "status": {"capacity": 30, "power": -2}},
                "junk": 3
            }),
        );
        assert_eq!(rollup(&mut map), (80, 3));
        assert_eq!(map["status"]["units"], 2);
        assert_eq!(map["status"]["SOC"], 40);
    }

    fn mesh() -> Mesh {
        let registry = Arc::new(WorkerRegistry::new());
        register(&registry);
        Mesh::new(
            Arc::new(Store::new()),
            TimerEngine::start(8),
            registry,
            Duration::from_millis(20),
        )
    }

    #[test]
    fn test_unit_count_is_capped() {
        let mut map = Map::new();
        assert_eq!(unit_count(&map), 0);
        map.insert("num_units".into(), json!(3));
        assert_eq!(unit_count(&map), 3);
        map.insert("num_units".into(), json!(-4));
        assert_eq!(unit_count(&map), 0);
        map.insert("num_units".into(), json!(1_000_000_000));
        assert_eq!(unit_count(&map), MAX_UNITS);
    }

    #[tokio::test]
    async fn test_bms_unit_fields_present_when_start_returns() {
        let mesh = mesh();
        let uri = "/mysys/ess/ess_1/bms/bms_7";
        mesh.start_worker(BMS_UNIT, uri).unwrap();

        let state = mesh.store().read(uri);
        assert_eq!(state["name"], "bms_7");
        assert_eq!(state["status"]["state"], "off");
        assert_eq!(state["commands"]["powerRequest"], 0);
        assert_eq!(state["maxpower"], 400);
    }

    #[tokio::test]
    async fn test_bms_master_caps_units() {
        let mesh = mesh();
        mesh.store()
            .merge("/ess/big", json!({"num_units": 1_000_000_000}))
            .unwrap();
        mesh.start_worker(BMS_MASTER, "/ess/big").unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            mesh.workers().running_count(),
            1 + MAX_UNITS as usize
        );
    }

    #[tokio::test]
    async fn test_bms_unit_initializes_on_spawn() {
        let mesh = mesh();
        let uri = "/mysys/ess/ess_1/bms/bms_2";
        mesh.start_worker(BMS_UNIT, uri).unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        let state = mesh.store().read(uri);
        assert_eq!(state["status"]["state"], "off");
        assert_eq!(state["commands"]["command"], "off");
        assert_eq!(state["status"]["SOC"], 100);
        assert_eq!(state["max_capacity"], 40000);
        assert!(state["count"].as_i64().unwrap_or(0) >= 1);
    }

    #[tokio::test]
    async fn test_bms_master_fans_out_units() {
        let mesh = mesh();
        mesh.store()
            .merge("/ess/ess_1", json!({"num_units": 3}))
            .unwrap();
        mesh.start_worker(BMS_MASTER, "/ess/ess_1").unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        for i in 0..3 {
            assert!(mesh.workers().is_running(&format!("/ess/ess_1/bms/bms_{}", i)));
        }
        // master plus three units
        assert_eq!(mesh.workers().running_count(), 4);
    }
}
