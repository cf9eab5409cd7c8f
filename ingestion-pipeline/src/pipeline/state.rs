use state_machines::state_machine;

state_machine! {
    name: DocumentMachine,
    state: DocumentState,
    initial: Claimed,
    states: [Claimed, Extracted, Chunked, Embedded, Finished, Failed],
    events {
        extract { transition: { from: Claimed, to: Extracted } }
        chunk { transition: { from: Extracted, to: Chunked } }
        embed { transition: { from: Chunked, to: Embedded } }
        finish { transition: { from: Embedded, to: Finished } }
        abort {
            transition: { from: Claimed, to: Failed }
            transition: { from: Extracted, to: Failed }
            transition: { from: Chunked, to: Failed }
            transition: { from: Embedded, to: Failed }
        }
    }
}

pub fn claimed() -> DocumentMachine<(), Claimed> {
    DocumentMachine::new(())
}
