use crate::telegram::FieldId;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// OBIS counter codes the sinks can be configured to track.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CounterCode {
    Used1,
    Used2,
    Used3,
    Used4,
    Gas,
    Delivered1,
    Delivered2,
    Delivered3,
    Delivered4,
    PowerUsed,
    PowerDelivered,
    VoltageL1,
    VoltageL2,
    VoltageL3,
    CurrentL1,
    CurrentL2,
    CurrentL3,
    PowerL1Positive,
    PowerL2Positive,
    PowerL3Positive,
    PowerL1Negative,
    PowerL2Negative,
    PowerL3Negative,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CounterClass {
    Consumption,
    Production,
    Raw,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CounterDef {
    pub field: FieldId,
    pub code: CounterCode,
    pub class: CounterClass,
    pub table: &'static str,
    pub unit: &'static str,
}

const fn def(
    field: FieldId,
    code: CounterCode,
    class: CounterClass,
    table: &'static str,
    unit: &'static str,
) -> CounterDef {
    CounterDef {
        field,
        code,
        class,
        table,
        unit,
    }
}

use CounterClass::{Consumption, Production, Raw};

const COUNTERS: &[CounterDef] = &[
    def(FieldId::ElectricityUsedTariff1, CounterCode::Used1, Consumption, "CONSUMED_1_8_1", "kWh"),
    def(FieldId::ElectricityUsedTariff2, CounterCode::Used2, Consumption, "CONSUMED_1_8_2", "kWh"),
    def(FieldId::ElectricityUsedTariff3, CounterCode::Used3, Consumption, "CONSUMED_1_8_3", "kWh"),
    def(FieldId::ElectricityUsedTariff4, CounterCode::Used4, Consumption, "CONSUMED_1_8_4", "kWh"),
    def(FieldId::HourlyGasMeterReading, CounterCode::Gas, Consumption, "CONSUMED_24_2_1", "m3"),
    def(FieldId::ElectricityDeliveredTariff1, CounterCode::Delivered1, Production, "PRODUCED_2_8_1", "kWh"),
    def(FieldId::ElectricityDeliveredTariff2, CounterCode::Delivered2, Production, "PRODUCED_2_8_2", "kWh"),
    def(FieldId::ElectricityDeliveredTariff3, CounterCode::Delivered3, Production, "PRODUCED_2_8_3", "kWh"),
    def(FieldId::ElectricityDeliveredTariff4, CounterCode::Delivered4, Production, "PRODUCED_2_8_4", "kWh"),
    def(FieldId::CurrentElectricityUsage, CounterCode::PowerUsed, Raw, "RAW_1_7_0", "kW"),
    def(FieldId::CurrentElectricityDelivery, CounterCode::PowerDelivered, Raw, "RAW_2_7_0", "kW"),
    def(FieldId::InstantaneousVoltageL1, CounterCode::VoltageL1, Raw, "RAW_32_7_0", "V"),
    def(FieldId::InstantaneousVoltageL2, CounterCode::VoltageL2, Raw, "RAW_52_7_0", "V"),
    def(FieldId::InstantaneousVoltageL3, CounterCode::VoltageL3, Raw, "RAW_72_7_0", "V"),
    def(FieldId::InstantaneousCurrentL1, CounterCode::CurrentL1, Raw, "RAW_31_7_0", "A"),
    def(FieldId::InstantaneousCurrentL2, CounterCode::CurrentL2, Raw, "RAW_51_7_0", "A"),
    def(FieldId::InstantaneousCurrentL3, CounterCode::CurrentL3, Raw, "RAW_71_7_0", "A"),
    def(FieldId::InstantaneousActivePowerL1Positive, CounterCode::PowerL1Positive, Raw, "RAW_21_7_0", "kW"),
    def(FieldId::InstantaneousActivePowerL2Positive, CounterCode::PowerL2Positive, Raw, "RAW_41_7_0", "kW"),
    def(FieldId::InstantaneousActivePowerL3Positive, CounterCode::PowerL3Positive, Raw, "RAW_61_7_0", "kW"),
    def(FieldId::InstantaneousActivePowerL1Negative, CounterCode::PowerL1Negative, Raw, "RAW_22_7_0", "kW"),
    def(FieldId::InstantaneousActivePowerL2Negative, CounterCode::PowerL2Negative, Raw, "RAW_42_7_0", "kW"),
    def(FieldId::InstantaneousActivePowerL3Negative, CounterCode::PowerL3Negative, Raw, "RAW_62_7_0", "kW"),
];

impl CounterCode {
    pub fn as_str(self) -> &'static str {
        match self {
            CounterCode::Used1 => "1.8.1",
            CounterCode::Used2 => "1.8.2",
            CounterCode::Used3 => "1.8.3",
            CounterCode::Used4 => "1.8.4",
            CounterCode::Gas => "24.2.1",
            CounterCode::Delivered1 => "2.8.1",
            CounterCode::Delivered2 => "2.8.2",
            CounterCode::Delivered3 => "2.8.3",
            CounterCode::Delivered4 => "2.8.4",
            CounterCode::PowerUsed => "1.7.0",
            CounterCode::PowerDelivered => "2.7.0",
            CounterCode::VoltageL1 => "32.7.0",
            CounterCode::VoltageL2 => "52.7.0",
            CounterCode::VoltageL3 => "72.7.0",
            CounterCode::CurrentL1 => "31.7.0",
            CounterCode::CurrentL2 => "51.7.0",
            CounterCode::CurrentL3 => "71.7.0",
            CounterCode::PowerL1Positive => "21.7.0",
            CounterCode::PowerL2Positive => "41.7.0",
            CounterCode::PowerL3Positive => "61.7.0",
            CounterCode::PowerL1Negative => "22.7.0",
            CounterCode::PowerL2Negative => "42.7.0",
            CounterCode::PowerL3Negative => "62.7.0",
        }
    }
}

impl fmt::Display for CounterCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown counter code {0:?}")]
pub struct UnknownCounter(pub String);

impl FromStr for CounterCode {
    type Err = UnknownCounter;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        COUNTERS
            .iter()
            .map(|def| def.code)
            .find(|code| code.as_str() == trimmed)
            .ok_or_else(|| UnknownCounter(raw.to_string()))
    }
}

/// Lookup from telegram field to counter, built once at startup.
#[derive(Debug, Clone)]
pub struct CounterMapping {
    by_field: HashMap<FieldId, CounterDef>,
    by_code: HashMap<CounterCode, CounterDef>,
}

impl CounterMapping {
    pub fn new() -> Self {
        Self {
            by_field: COUNTERS.iter().map(|def| (def.field, *def)).collect(),
            by_code: COUNTERS.iter().map(|def| (def.code, *def)).collect(),
        }
    }

    pub fn for_field(&self, field: FieldId) -> Option<&CounterDef> {
        self.by_field.get(&field)
    }

    pub fn for_code(&self, code: CounterCode) -> Option<&CounterDef> {
        self.by_code.get(&code)
    }
}

impl Default for CounterMapping {
    fn default() -> Self {
        Self::new()
    }
}
