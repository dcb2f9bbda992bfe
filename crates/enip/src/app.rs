//! The application collaborator contract (assembly callbacks).

/// I/O connection lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoConnectionEvent {
    Opened,
    TimedOut,
    Closed,
}

/// Callbacks into the device application around assembly data flow.
///
/// All callbacks run on the engine's single execution context, between
/// socket polls; they must not block.
pub trait AdapterApplication {
    /// Consumed data has been written into the assembly buffer.
    ///
    /// Return `false` to reject the data semantically. The packet is
    /// still counted for connection liveness, and no error goes on the
    /// wire, so timing is preserved.
    fn after_assembly_data_received(&mut self, instance_id: u32) -> bool;

    /// Called before each produced frame for the given assembly.
    ///
    /// Return `true` when the data changed since the last production;
    /// this advances the class-1 application sequence counter.
    fn before_assembly_data_send(&mut self, instance_id: u32) -> bool;

    /// An I/O connection on the given {output, input} pair changed state.
    fn io_connection_event(
        &mut self,
        output_assembly: u32,
        input_assembly: u32,
        event: IoConnectionEvent,
    );

    /// The 4-byte run/idle header of consumed data changed.
    fn run_idle_changed(&mut self, run_idle: u32);
}
