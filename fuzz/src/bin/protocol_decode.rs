#[macro_use]
extern crate afl;
use rendezchat::{ChatConfig, Command, DirectoryEntry, KeyPush, PushReply, RelayReply};

fn main() {
    let range = ChatConfig::default().port_range();

    fuzz!(|data: &[u8]| {
        let _ = Command::decode(data);
        let _ = DirectoryEntry::decode_list(data);
        let _ = KeyPush::decode(data);
        let _ = PushReply::decode(data, &range);
        let _ = RelayReply::decode(data, &range);
    });
}
