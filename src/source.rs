use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use btleplug::api::{
    BDAddr, Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use chrono::{DateTime, Local};
use thiserror::Error;
use uuid::Uuid;

use crate::reading::Reading;

pub const AR4_SERVICE: Uuid = Uuid::from_u128(0xf0cd1400_95da_4f4b_9ac8_aa55d312af0c);
pub const AR4_WRITE_CMD: Uuid = Uuid::from_u128(0xf0cd1402_95da_4f4b_9ac8_aa55d312af0c);
pub const AR4_TOTAL_READINGS: Uuid = Uuid::from_u128(0xf0cd2001_95da_4f4b_9ac8_aa55d312af0c);
pub const AR4_INTERVAL: Uuid = Uuid::from_u128(0xf0cd2002_95da_4f4b_9ac8_aa55d312af0c);
pub const AR4_HISTORY: Uuid = Uuid::from_u128(0xf0cd2003_95da_4f4b_9ac8_aa55d312af0c);
pub const AR4_SECONDS_SINCE_UPDATE: Uuid = Uuid::from_u128(0xf0cd2004_95da_4f4b_9ac8_aa55d312af0c);

pub const CMD_SELECT_HISTORY_RANGE: u8 = 0x82;

const SCAN_POLL_DELAY: Duration = Duration::from_millis(500);
const SCAN_POLL_ATTEMPTS: usize = 20;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const FETCH_DEADLINE: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy)]
pub struct HistoryFilter {
    pub last: u16,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Failed to connect to the Aranet device: {0}")]
    Connection(String),
    #[error("Operation timed out while talking to the Aranet device")]
    Timeout,
    #[error("Unexpected fetch error: {0}")]
    Unexpected(String),
}

impl From<btleplug::Error> for FetchError {
    fn from(e: btleplug::Error) -> FetchError {
        use btleplug::Error;
        match e {
            Error::TimedOut(_) => FetchError::Timeout,
            e @ (Error::DeviceNotFound | Error::NotConnected | Error::PermissionDenied) => {
                FetchError::Connection(e.to_string())
            }
            e => FetchError::Unexpected(e.to_string()),
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum HistoryParam {
    Temperature = 1,
    Humidity = 2,
    Pressure = 3,
    Co2 = 4,
}

pub async fn fetch_history(
    address: &str,
    filter: &HistoryFilter,
) -> Result<Vec<Reading>, FetchError> {
    let address: BDAddr = address
        .parse()
        .map_err(|e| FetchError::Unexpected(format!("invalid device address {address:?}: {e}")))?;

    let manager = Manager::new().await?;
    let central = manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| FetchError::Connection("no Bluetooth adapter available".into()))?;

    central
        .start_scan(ScanFilter {
            services: vec![AR4_SERVICE],
        })
        .await?;
    let discovered = (|| async { find_peripheral(&central, address).await })
        .retry(discovery_backoff())
        .notify(|e, delay| {
            log::debug!("{e}");
            log::debug!("Scanning again in {delay:?}");
        })
        .await;
    if let Err(e) = central.stop_scan().await {
        log::debug!("Failed to stop scanning: {e}");
    }
    let peripheral = discovered?;

    tokio::time::timeout(CONNECT_TIMEOUT, peripheral.connect())
        .await
        .map_err(|_| FetchError::Timeout)??;
    log::debug!("Connected to {address}");

    let download = download_history(&peripheral, filter);
    let result = match tokio::time::timeout(FETCH_DEADLINE, download).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout),
    };
    if let Err(e) = peripheral.disconnect().await {
        log::debug!("Failed to disconnect from {address}: {e}");
    }

    let readings = result?;
    log::info!("Fetched {} records from the device", readings.len());
    Ok(readings)
}

fn discovery_backoff() -> ConstantBuilder {
    ConstantBuilder::default()
        .with_delay(SCAN_POLL_DELAY)
        .with_max_times(SCAN_POLL_ATTEMPTS)
}

async fn find_peripheral(central: &Adapter, address: BDAddr) -> Result<Peripheral, FetchError> {
    central
        .peripherals()
        .await?
        .into_iter()
        .find(|peripheral| peripheral.address() == address)
        .ok_or_else(|| FetchError::Connection(format!("device {address} not found")))
}

async fn download_history(
    peripheral: &Peripheral,
    filter: &HistoryFilter,
) -> Result<Vec<Reading>, FetchError> {
    peripheral.discover_services().await?;

    let total = read_u16(peripheral, AR4_TOTAL_READINGS).await?;
    if total == 0 || filter.last == 0 {
        return Ok(Vec::new());
    }
    let interval = read_u16(peripheral, AR4_INTERVAL).await?;
    let ago = read_u16(peripheral, AR4_SECONDS_SINCE_UPDATE).await?;

    let start = start_index(total, filter.last);
    log::debug!("{total} records on device, fetching {start}..={total} at {interval}s interval");

    let reader = SeriesReader {
        peripheral,
        command: find_characteristic(peripheral, AR4_WRITE_CMD)?,
        history: find_characteristic(peripheral, AR4_HISTORY)?,
        start,
        end: total,
    };
    let raw = RawHistory {
        start,
        total,
        interval,
        newest: Local::now().timestamp() - i64::from(ago),
        temperature: reader.series(HistoryParam::Temperature).await?,
        humidity: reader.series(HistoryParam::Humidity).await?,
        pressure: reader.series(HistoryParam::Pressure).await?,
        co2: reader.series(HistoryParam::Co2).await?,
    };
    raw.into_readings()
}

fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic, FetchError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|characteristic| characteristic.uuid == uuid)
        .ok_or_else(|| FetchError::Unexpected(format!("device has no characteristic {uuid}")))
}

async fn read_u16(peripheral: &Peripheral, uuid: Uuid) -> Result<u16, FetchError> {
    let characteristic = find_characteristic(peripheral, uuid)?;
    let data = peripheral.read(&characteristic).await?;
    if data.len() < 2 {
        return Err(FetchError::Unexpected(format!(
            "expected two bytes from {uuid}, got {}",
            data.len()
        )));
    }
    Ok(u16::from_le_bytes([data[0], data[1]]))
}

struct SeriesReader<'a> {
    peripheral: &'a Peripheral,
    command: Characteristic,
    history: Characteristic,
    start: u16,
    end: u16,
}

impl SeriesReader<'_> {
    // Selects `param` over the range, then drains the history characteristic
    // until every sample in the range has arrived.
    async fn series(&self, param: HistoryParam) -> Result<Vec<u16>, FetchError> {
        let request = history_request(param, self.start, self.end);
        self.peripheral
            .write(&self.command, &request, WriteType::WithResponse)
            .await?;

        let expected = usize::from(self.end - self.start) + 1;
        let mut values = Vec::with_capacity(expected);
        while values.len() < expected {
            let packet = self.peripheral.read(&self.history).await?;
            let chunk = decode_history_chunk(&packet)?;
            if chunk.param != param as u8 {
                return Err(FetchError::Unexpected(format!(
                    "device answered for parameter {} while reading {param:?}",
                    chunk.param
                )));
            }
            log::trace!(
                "History packet: param {} first {} count {}",
                chunk.param,
                chunk.start,
                chunk.values.len()
            );
            if chunk.values.is_empty() {
                break;
            }
            values.extend(chunk.values);
        }
        if values.len() < expected {
            return Err(FetchError::Unexpected(format!(
                "device returned {} of {expected} samples for {param:?}",
                values.len()
            )));
        }
        values.truncate(expected);
        Ok(values)
    }
}

fn history_request(param: HistoryParam, start: u16, end: u16) -> [u8; 6] {
    let start = start.to_le_bytes();
    let end = end.to_le_bytes();
    [CMD_SELECT_HISTORY_RANGE, param as u8, start[0], start[1], end[0], end[1]]
}

struct HistoryChunk {
    param: u8,
    start: u16,
    values: Vec<u16>,
}

fn decode_history_chunk(packet: &[u8]) -> Result<HistoryChunk, FetchError> {
    if packet.len() < 4 {
        return Err(FetchError::Unexpected(format!(
            "history packet too short: {} bytes",
            packet.len()
        )));
    }
    let param = packet[0];
    let start = u16::from_le_bytes([packet[1], packet[2]]);
    let count = usize::from(packet[3]);
    let payload = &packet[4..];
    if payload.len() < count * 2 {
        return Err(FetchError::Unexpected(format!(
            "history packet truncated: {count} samples announced, {} payload bytes",
            payload.len()
        )));
    }
    let values = payload
        .chunks_exact(2)
        .take(count)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Ok(HistoryChunk { param, start, values })
}

// 1-based index of the oldest record to download.
fn start_index(total: u16, last: u16) -> u16 {
    total.saturating_sub(last) + 1
}

struct RawHistory {
    start: u16,
    total: u16,
    interval: u16,
    newest: i64,
    temperature: Vec<u16>,
    humidity: Vec<u16>,
    pressure: Vec<u16>,
    co2: Vec<u16>,
}

impl RawHistory {
    // Temperature is reported as °C x20 and pressure as hPa x10.
    fn into_readings(self) -> Result<Vec<Reading>, FetchError> {
        let RawHistory {
            start,
            total,
            interval,
            newest,
            temperature,
            humidity,
            pressure,
            co2,
        } = self;

        let n = co2.len();
        if temperature.len() != n || humidity.len() != n || pressure.len() != n {
            return Err(FetchError::Unexpected(format!(
                "history series lengths disagree: co2={n}, temperature={}, humidity={}, pressure={}",
                temperature.len(),
                humidity.len(),
                pressure.len()
            )));
        }

        let mut readings = Vec::with_capacity(n);
        for k in 0..n {
            let index = start + k as u16;
            let seconds = newest - (i64::from(total) - i64::from(index)) * i64::from(interval);
            let timestamp = DateTime::from_timestamp(seconds, 0)
                .ok_or_else(|| {
                    FetchError::Unexpected(format!("record {index} timestamp out of range"))
                })?
                .with_timezone(&Local);
            readings.push(Reading {
                timestamp,
                co2: co2[k],
                temperature: f32::from(temperature[k]) / 20.0,
                humidity: humidity[k],
                pressure: f32::from(pressure[k]) / 10.0,
            });
        }
        readings.retain(|reading| !is_empty_slot(reading));
        Ok(readings)
    }
}

// An all-zero slot is history the device has not written yet.
fn is_empty_slot(reading: &Reading) -> bool {
    reading.co2 == 0
        && reading.humidity == 0
        && reading.temperature == 0.0
        && reading.pressure == 0.0
}
