//! Shared fixtures for unit tests.

use hl7::{Message, StructureRegistry};

/// Lab result with two orders; the first order carries two observations.
pub(crate) const ORU: &str = "MSH|^~\\&|LAB|HOSP|EHR|HOSP|20240101120000||ORU^R01^ORU_R01|MSG1|P|2.5.1\r\
PID|1||12345^^^HOSP^MR~99^^^NHS^NH||DOE^JANE^Q||19800101|F\r\
PV1|1|O|WARD1\r\
ORC|RE|ORD1\r\
OBR|1|ORD1|FIL1|24331-1^Lipid panel^LN|||20240101090000\r\
OBX|1|NM|2093-3^Cholesterol^LN||196|mg/dL^milligram per deciliter^UCUM|||||F\r\
NTE|1||fasting\r\
OBX|2|NM|2571-8^Triglyceride^LN||90|mg/dL|||||F\r\
ORC|RE|ORD2\r\
OBR|2|ORD2|FIL2|4548-4^HbA1c^LN|||20240101093000\r\
OBX|1|NM|4548-4^HbA1c^LN||5.4|%|||||F\r";

pub(crate) fn parse(text: &str) -> Message {
    let registry = StructureRegistry::with_defaults().expect("bundled structures");
    hl7::parse(text, &registry).expect("test message parses")
}
