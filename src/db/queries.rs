use anyhow::Result;
use sqlx::{SqliteConnection, SqliteExecutor, SqlitePool};
use uuid::Uuid;

use super::models::{Actuator, Command, Device, DeviceCommand, Reading, Sensor};

// ─── Device queries ──────────────────────────────────────────────────────────

pub async fn list_devices(pool: &SqlitePool) -> Result<Vec<Device>> {
    let devices = sqlx::query_as::<_, Device>("SELECT * FROM devices ORDER BY registered_at DESC")
        .fetch_all(pool)
        .await?;
    Ok(devices)
}

pub async fn get_device<'e>(exec: impl SqliteExecutor<'e>, id: &str) -> Result<Option<Device>> {
    let device = sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE id = ?")
        .bind(id)
        .fetch_optional(exec)
        .await?;
    Ok(device)
}

/// Returns false when the (project, slot) pair is already registered.
pub async fn insert_device(pool: &SqlitePool, d: &Device) -> Result<bool> {
    let result = sqlx::query(
        "INSERT INTO devices (id, project_code, slot, name, secret_hash, revoked, status, last_contact_at, registered_at, firmware_version, config_version, hostname, ip_address, rssi)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT DO NOTHING",
    )
    .bind(&d.id)
    .bind(&d.project_code)
    .bind(d.slot)
    .bind(&d.name)
    .bind(&d.secret_hash)
    .bind(d.revoked)
    .bind(&d.status)
    .bind(&d.last_contact_at)
    .bind(&d.registered_at)
    .bind(&d.firmware_version)
    .bind(d.config_version)
    .bind(&d.hostname)
    .bind(&d.ip_address)
    .bind(d.rssi)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Persist the first secret hash. Only succeeds while no hash is bound.
pub async fn bind_secret_hash<'e>(
    exec: impl SqliteExecutor<'e>,
    id: &str,
    secret_hash: &str,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE devices SET secret_hash = ? WHERE id = ? AND secret_hash IS NULL AND revoked = 0",
    )
    .bind(secret_hash)
    .bind(id)
    .execute(exec)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn revoke_device(pool: &SqlitePool, id: &str) -> Result<bool> {
    let result = sqlx::query("UPDATE devices SET secret_hash = NULL, revoked = 1 WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn reprovision_device(pool: &SqlitePool, id: &str) -> Result<bool> {
    let result = sqlx::query("UPDATE devices SET secret_hash = NULL, revoked = 0 WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn delete_device(pool: &SqlitePool, id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM devices WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Mark a device online at `now`, merging any reported network metadata.
/// Returns the device's current config version.
#[allow(clippy::too_many_arguments)]
pub async fn record_contact<'e>(
    exec: impl SqliteExecutor<'e>,
    id: &str,
    now: &str,
    firmware_version: Option<&str>,
    hostname: Option<&str>,
    ip_address: Option<&str>,
    rssi: Option<i64>,
) -> Result<Option<i64>> {
    let version = sqlx::query_scalar::<_, i64>(
        "UPDATE devices SET
           status = 'online',
           last_contact_at = ?,
           firmware_version = COALESCE(?, firmware_version),
           hostname = COALESCE(?, hostname),
           ip_address = COALESCE(?, ip_address),
           rssi = COALESCE(?, rssi)
         WHERE id = ?
         RETURNING config_version",
    )
    .bind(now)
    .bind(firmware_version)
    .bind(hostname)
    .bind(ip_address)
    .bind(rssi)
    .bind(id)
    .fetch_optional(exec)
    .await?;
    Ok(version)
}

/// online -> offline for devices silent since before `cutoff`.
pub async fn demote_stale_devices(pool: &SqlitePool, cutoff: &str) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar::<_, String>(
        "UPDATE devices SET status = 'offline'
         WHERE status = 'online' AND last_contact_at < ?
         RETURNING id",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

/// offline -> connection_failed for never-contacted devices registered in
/// (`registered_after`, `registered_before`].
pub async fn flag_failed_joins(
    pool: &SqlitePool,
    registered_after: &str,
    registered_before: &str,
) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar::<_, String>(
        "UPDATE devices SET status = 'connection_failed'
         WHERE status = 'offline'
           AND last_contact_at IS NULL
           AND registered_at > ?
           AND registered_at <= ?
         RETURNING id",
    )
    .bind(registered_after)
    .bind(registered_before)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

pub async fn get_config_version<'e>(
    exec: impl SqliteExecutor<'e>,
    device_id: &str,
) -> Result<Option<i64>> {
    let version = sqlx::query_scalar::<_, i64>("SELECT config_version FROM devices WHERE id = ?")
        .bind(device_id)
        .fetch_optional(exec)
        .await?;
    Ok(version)
}

// ─── Sensor queries ──────────────────────────────────────────────────────────

pub async fn list_sensors<'e>(exec: impl SqliteExecutor<'e>, device_id: &str) -> Result<Vec<Sensor>> {
    let sensors = sqlx::query_as::<_, Sensor>(
        "SELECT * FROM sensors WHERE device_id = ? ORDER BY local_id",
    )
    .bind(device_id)
    .fetch_all(exec)
    .await?;
    Ok(sensors)
}

pub async fn list_active_sensors<'e>(
    exec: impl SqliteExecutor<'e>,
    device_id: &str,
) -> Result<Vec<Sensor>> {
    let sensors = sqlx::query_as::<_, Sensor>(
        "SELECT * FROM sensors WHERE device_id = ? AND is_active = 1 ORDER BY local_id",
    )
    .bind(device_id)
    .fetch_all(exec)
    .await?;
    Ok(sensors)
}

pub async fn get_sensor(pool: &SqlitePool, id: &str) -> Result<Option<Sensor>> {
    let sensor = sqlx::query_as::<_, Sensor>("SELECT * FROM sensors WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(sensor)
}

pub async fn find_sensor<'e>(
    exec: impl SqliteExecutor<'e>,
    device_id: &str,
    local_id: &str,
) -> Result<Option<Sensor>> {
    let sensor = sqlx::query_as::<_, Sensor>(
        "SELECT * FROM sensors WHERE device_id = ? AND local_id = ?",
    )
    .bind(device_id)
    .bind(local_id)
    .fetch_optional(exec)
    .await?;
    Ok(sensor)
}

/// Insert or refresh a sensor by its natural key. Re-reporting reactivates it.
#[allow(clippy::too_many_arguments)]
pub async fn upsert_sensor(
    conn: &mut SqliteConnection,
    device_id: &str,
    local_id: &str,
    sensor_type: &str,
    unit: Option<&str>,
    name: Option<&str>,
    now: &str,
) -> Result<Sensor> {
    let sensor = sqlx::query_as::<_, Sensor>(
        "INSERT INTO sensors (id, device_id, local_id, sensor_type, unit, name, is_active, discovered_at, last_seen_at)
         VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)
         ON CONFLICT(device_id, local_id) DO UPDATE SET
           sensor_type = excluded.sensor_type,
           unit = COALESCE(excluded.unit, sensors.unit),
           name = COALESCE(excluded.name, sensors.name),
           is_active = 1,
           last_seen_at = excluded.last_seen_at
         RETURNING *",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(device_id)
    .bind(local_id)
    .bind(sensor_type)
    .bind(unit)
    .bind(name)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    Ok(sensor)
}

pub async fn set_sensor_active(
    pool: &SqlitePool,
    device_id: &str,
    local_id: &str,
    active: bool,
) -> Result<bool> {
    let result = sqlx::query("UPDATE sensors SET is_active = ? WHERE device_id = ? AND local_id = ?")
        .bind(active)
        .bind(device_id)
        .bind(local_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn delete_sensor(pool: &SqlitePool, device_id: &str, local_id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM sensors WHERE device_id = ? AND local_id = ?")
        .bind(device_id)
        .bind(local_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

// ─── Actuator queries ────────────────────────────────────────────────────────

pub async fn list_actuators<'e>(
    exec: impl SqliteExecutor<'e>,
    device_id: &str,
) -> Result<Vec<Actuator>> {
    let actuators = sqlx::query_as::<_, Actuator>(
        "SELECT * FROM actuators WHERE device_id = ? ORDER BY local_id",
    )
    .bind(device_id)
    .fetch_all(exec)
    .await?;
    Ok(actuators)
}

pub async fn list_active_actuators<'e>(
    exec: impl SqliteExecutor<'e>,
    device_id: &str,
) -> Result<Vec<Actuator>> {
    let actuators = sqlx::query_as::<_, Actuator>(
        "SELECT * FROM actuators WHERE device_id = ? AND is_active = 1 ORDER BY local_id",
    )
    .bind(device_id)
    .fetch_all(exec)
    .await?;
    Ok(actuators)
}

pub async fn find_actuator<'e>(
    exec: impl SqliteExecutor<'e>,
    device_id: &str,
    local_id: &str,
) -> Result<Option<Actuator>> {
    let actuator = sqlx::query_as::<_, Actuator>(
        "SELECT * FROM actuators WHERE device_id = ? AND local_id = ?",
    )
    .bind(device_id)
    .bind(local_id)
    .fetch_optional(exec)
    .await?;
    Ok(actuator)
}

pub async fn upsert_actuator(
    conn: &mut SqliteConnection,
    device_id: &str,
    local_id: &str,
    actuator_type: &str,
    supports_pwm: bool,
    now: &str,
) -> Result<Actuator> {
    let actuator = sqlx::query_as::<_, Actuator>(
        "INSERT INTO actuators (id, device_id, local_id, actuator_type, supports_pwm, is_on, current_value, is_active, discovered_at)
         VALUES (?, ?, ?, ?, ?, 0, NULL, 1, ?)
         ON CONFLICT(device_id, local_id) DO UPDATE SET
           actuator_type = excluded.actuator_type,
           supports_pwm = excluded.supports_pwm,
           is_active = 1
         RETURNING *",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(device_id)
    .bind(local_id)
    .bind(actuator_type)
    .bind(supports_pwm)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    Ok(actuator)
}

/// Reflect a confirmed command on the actuator's current state.
pub async fn apply_actuator_state(
    conn: &mut SqliteConnection,
    actuator_id: &str,
    is_on: bool,
    current_value: Option<i64>,
) -> Result<()> {
    sqlx::query("UPDATE actuators SET is_on = ?, current_value = COALESCE(?, current_value) WHERE id = ?")
        .bind(is_on)
        .bind(current_value)
        .bind(actuator_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn set_actuator_active(
    pool: &SqlitePool,
    device_id: &str,
    local_id: &str,
    active: bool,
) -> Result<bool> {
    let result =
        sqlx::query("UPDATE actuators SET is_active = ? WHERE device_id = ? AND local_id = ?")
            .bind(active)
            .bind(device_id)
            .bind(local_id)
            .execute(pool)
            .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn delete_actuator(pool: &SqlitePool, device_id: &str, local_id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM actuators WHERE device_id = ? AND local_id = ?")
        .bind(device_id)
        .bind(local_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

// ─── Reading queries ─────────────────────────────────────────────────────────

pub async fn insert_reading(
    conn: &mut SqliteConnection,
    sensor_id: &str,
    value: f64,
    unit: Option<&str>,
    recorded_at: &str,
) -> Result<()> {
    sqlx::query("INSERT INTO readings (sensor_id, value, unit, recorded_at) VALUES (?, ?, ?, ?)")
        .bind(sensor_id)
        .bind(value)
        .bind(unit)
        .bind(recorded_at)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn list_readings(pool: &SqlitePool, sensor_id: &str, limit: i64) -> Result<Vec<Reading>> {
    let readings = sqlx::query_as::<_, Reading>(
        "SELECT * FROM readings WHERE sensor_id = ? ORDER BY recorded_at DESC, id DESC LIMIT ?",
    )
    .bind(sensor_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(readings)
}

// ─── Command queries ─────────────────────────────────────────────────────────

pub async fn insert_command(pool: &SqlitePool, c: &Command) -> Result<()> {
    sqlx::query(
        "INSERT INTO commands (id, device_id, actuator_id, kind, value, status, error_message, created_at, retrieved_at, confirmed_at, expires_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&c.id)
    .bind(&c.device_id)
    .bind(&c.actuator_id)
    .bind(&c.kind)
    .bind(c.value)
    .bind(&c.status)
    .bind(&c.error_message)
    .bind(&c.created_at)
    .bind(&c.retrieved_at)
    .bind(&c.confirmed_at)
    .bind(&c.expires_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_command(pool: &SqlitePool, id: &str) -> Result<Option<Command>> {
    let command = sqlx::query_as::<_, Command>("SELECT * FROM commands WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(command)
}

pub async fn list_commands(pool: &SqlitePool, device_id: &str) -> Result<Vec<Command>> {
    let commands = sqlx::query_as::<_, Command>(
        "SELECT * FROM commands WHERE device_id = ? ORDER BY created_at DESC",
    )
    .bind(device_id)
    .fetch_all(pool)
    .await?;
    Ok(commands)
}

/// Claim up to `limit` unexpired pending commands in one statement.
///
/// Selection and the `pending -> retrieved` transition happen in the same
/// UPDATE, so two concurrent callers can never both receive a command.
pub async fn claim_pending_commands(
    pool: &SqlitePool,
    device_id: &str,
    now: &str,
    limit: i64,
) -> Result<Vec<Command>> {
    let mut claimed = sqlx::query_as::<_, ClaimedCommand>(
        "UPDATE commands SET status = 'retrieved', retrieved_at = ?
         WHERE status = 'pending'
           AND id IN (
             SELECT id FROM commands
             WHERE device_id = ? AND status = 'pending' AND expires_at > ?
             ORDER BY created_at, rowid
             LIMIT ?
           )
         RETURNING *, rowid AS claim_seq",
    )
    .bind(now)
    .bind(device_id)
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    // RETURNING order is unspecified; restore the selection order
    claimed.sort_by(|a, b| {
        (&a.command.created_at, a.claim_seq).cmp(&(&b.command.created_at, b.claim_seq))
    });
    Ok(claimed.into_iter().map(|c| c.command).collect())
}

/// A claimed row plus its rowid, which breaks ties between rows created in
/// the same millisecond.
#[derive(sqlx::FromRow)]
struct ClaimedCommand {
    #[sqlx(flatten)]
    command: Command,
    claim_seq: i64,
}

/// `retrieved -> confirmed|failed` for a command owned by `device_id`.
pub async fn complete_command(
    conn: &mut SqliteConnection,
    id: &str,
    device_id: &str,
    status: &str,
    error_message: Option<&str>,
    now: &str,
) -> Result<Option<Command>> {
    let command = sqlx::query_as::<_, Command>(
        "UPDATE commands SET status = ?, confirmed_at = ?, error_message = ?
         WHERE id = ? AND device_id = ? AND status = 'retrieved'
         RETURNING *",
    )
    .bind(status)
    .bind(now)
    .bind(error_message)
    .bind(id)
    .bind(device_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(command)
}

/// `pending -> expired` for every pending command past its expiry.
pub async fn expire_pending_commands(pool: &SqlitePool, now: &str) -> Result<Vec<Command>> {
    let commands = sqlx::query_as::<_, Command>(
        "UPDATE commands SET status = 'expired'
         WHERE status = 'pending' AND expires_at <= ?
         RETURNING *",
    )
    .bind(now)
    .fetch_all(pool)
    .await?;
    Ok(commands)
}

// ─── Device command queries ──────────────────────────────────────────────────

pub async fn insert_device_command(pool: &SqlitePool, c: &DeviceCommand) -> Result<()> {
    sqlx::query(
        "INSERT INTO device_commands (id, device_id, kind, wifi_ssid, wifi_password, status, error_message, created_at, retrieved_at, confirmed_at, expires_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&c.id)
    .bind(&c.device_id)
    .bind(&c.kind)
    .bind(&c.wifi_ssid)
    .bind(&c.wifi_password)
    .bind(&c.status)
    .bind(&c.error_message)
    .bind(&c.created_at)
    .bind(&c.retrieved_at)
    .bind(&c.confirmed_at)
    .bind(&c.expires_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_device_command(pool: &SqlitePool, id: &str) -> Result<Option<DeviceCommand>> {
    let command = sqlx::query_as::<_, DeviceCommand>("SELECT * FROM device_commands WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(command)
}

pub async fn list_device_commands(pool: &SqlitePool, device_id: &str) -> Result<Vec<DeviceCommand>> {
    let commands = sqlx::query_as::<_, DeviceCommand>(
        "SELECT * FROM device_commands WHERE device_id = ? ORDER BY created_at DESC",
    )
    .bind(device_id)
    .fetch_all(pool)
    .await?;
    Ok(commands)
}

/// Claim the device's oldest unexpired pending device command, if any.
pub async fn claim_device_command(
    pool: &SqlitePool,
    device_id: &str,
    now: &str,
) -> Result<Option<DeviceCommand>> {
    let command = sqlx::query_as::<_, DeviceCommand>(
        "UPDATE device_commands SET status = 'retrieved', retrieved_at = ?
         WHERE status = 'pending'
           AND id = (
             SELECT id FROM device_commands
             WHERE device_id = ? AND status = 'pending' AND expires_at > ?
             ORDER BY created_at, rowid
             LIMIT 1
           )
         RETURNING *",
    )
    .bind(now)
    .bind(device_id)
    .bind(now)
    .fetch_optional(pool)
    .await?;
    Ok(command)
}

/// `retrieved -> confirmed|failed` for a device command owned by `device_id`.
pub async fn complete_device_command(
    pool: &SqlitePool,
    id: &str,
    device_id: &str,
    status: &str,
    error_message: Option<&str>,
    now: &str,
) -> Result<Option<DeviceCommand>> {
    let command = sqlx::query_as::<_, DeviceCommand>(
        "UPDATE device_commands SET status = ?, confirmed_at = ?, error_message = ?
         WHERE id = ? AND device_id = ? AND status = 'retrieved'
         RETURNING *",
    )
    .bind(status)
    .bind(now)
    .bind(error_message)
    .bind(id)
    .bind(device_id)
    .fetch_optional(pool)
    .await?;
    Ok(command)
}

pub async fn expire_pending_device_commands(pool: &SqlitePool, now: &str) -> Result<Vec<DeviceCommand>> {
    let commands = sqlx::query_as::<_, DeviceCommand>(
        "UPDATE device_commands SET status = 'expired'
         WHERE status = 'pending' AND expires_at <= ?
         RETURNING *",
    )
    .bind(now)
    .fetch_all(pool)
    .await?;
    Ok(commands)
}
