use pixwire_wire::{
    read_message, send_message, write_message, Message, MessageRef, Param, ProcCall,
    SharedWireBuffer, TileReq, Transport, TransportError, WireError,
};
use std::thread;

#[test]
fn messages_cross_threads_in_order() {
    let (mut host, mut plugin) = SharedWireBuffer::pair(4096);

    let peer = thread::spawn(move || {
        let mut seen = Vec::new();
        loop {
            let message = read_message(&mut plugin).unwrap();
            let done = message == Message::Quit;
            seen.push(message);
            if done {
                break;
            }
        }
        seen
    });

    let call = ProcCall::new("plug_in_invert", vec![Param::Int32(1), Param::Drawable(4)]);
    write_message(&mut host, MessageRef::ProcRun(call.view())).unwrap();
    write_message(&mut host, MessageRef::TileReq(TileReq::put())).unwrap();
    send_message(&mut host, MessageRef::Quit).unwrap();

    let seen = peer.join().unwrap();
    assert_eq!(
        seen,
        vec![
            Message::ProcRun(call),
            Message::TileReq(TileReq::put()),
            Message::Quit
        ]
    );
}

#[test]
fn eof_in_the_middle_of_a_message_is_a_transport_error() {
    let (mut host, mut plugin) = SharedWireBuffer::pair(4096);
    // Type tag for PROC_RUN and half of the name length.
    host.write(&[0, 0, 0, 6, 0, 0]).unwrap();
    drop(host);

    let err = read_message(&mut plugin).unwrap_err();
    assert!(matches!(
        err,
        WireError::Transport(TransportError::UnexpectedEof)
    ));
}

#[cfg(unix)]
#[test]
fn pipe_transport_round_trips_through_a_child_process() {
    use pixwire_wire::PipeTransport;
    use std::process::{Command, Stdio};

    let mut child = Command::new("cat")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .expect("cat should be available");
    let stdin = child.stdin.take().unwrap();
    let stdout = child.stdout.take().unwrap();
    let mut pipe = PipeTransport::with_capacity(stdout, stdin, 16);

    let call = ProcCall::new(
        "file_png_load",
        vec![
            Param::Int32(0),
            Param::string("/tmp/a.png"),
            Param::string("a.png"),
        ],
    );
    send_message(&mut pipe, MessageRef::ProcRun(call.view())).unwrap();
    assert_eq!(read_message(&mut pipe).unwrap(), Message::ProcRun(call));

    pipe.close();
    child.wait().unwrap();
}
