use super::{Event, EventKind, ExceptionInfo};
use crate::native::{self, RawDebugEvent, RawPayload};

/// Turns raw debug notifications into [Event]s.
pub struct EventFactory;

impl EventFactory {
    /// Builds the event matching a raw notification.
    ///
    /// This never fails: unknown event codes, and codes whose payload does
    /// not match, produce an [EventKind::Unknown] event.
    pub fn from_raw(raw: RawDebugEvent) -> Event {
        let RawDebugEvent {
            code,
            process_id,
            thread_id,
            payload,
        } = raw;

        let kind = match (code, payload) {
            (native::EXCEPTION_DEBUG_EVENT, RawPayload::Exception { record, first_chance }) => {
                EventKind::Exception(ExceptionInfo::from_record(record, first_chance != 0))
            }
            (
                native::CREATE_THREAD_DEBUG_EVENT,
                RawPayload::CreateThread { start_address, teb },
            ) => EventKind::CreateThread { start_address, teb },
            (
                native::CREATE_PROCESS_DEBUG_EVENT,
                RawPayload::CreateProcess {
                    image_base,
                    start_address,
                    teb,
                    file_name,
                },
            ) => EventKind::CreateProcess {
                image_base,
                start_address,
                teb,
                file_name,
            },
            (native::EXIT_THREAD_DEBUG_EVENT, RawPayload::ExitThread { exit_code }) => {
                EventKind::ExitThread { exit_code }
            }
            (native::EXIT_PROCESS_DEBUG_EVENT, RawPayload::ExitProcess { exit_code }) => {
                EventKind::ExitProcess { exit_code }
            }
            (native::LOAD_DLL_DEBUG_EVENT, RawPayload::LoadDll { base, file_name }) => {
                EventKind::LoadDll { base, file_name }
            }
            (native::UNLOAD_DLL_DEBUG_EVENT, RawPayload::UnloadDll { base }) => {
                EventKind::UnloadDll { base }
            }
            (
                native::OUTPUT_DEBUG_STRING_EVENT,
                RawPayload::OutputDebugString {
                    address,
                    length,
                    unicode,
                },
            ) => EventKind::OutputDebugString {
                address,
                length,
                unicode,
            },
            (native::RIP_EVENT, RawPayload::Rip { error, kind }) => EventKind::Rip { error, kind },
            (code, _) => {
                tracing::warn!(code, pid = process_id, tid = thread_id, "unknown debug event");
                EventKind::Unknown { code }
            }
        };

        Event::new(process_id, thread_id, code, kind)
    }
}
