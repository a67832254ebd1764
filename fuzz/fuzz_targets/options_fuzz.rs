#![no_main]
use arbitrary::Arbitrary;
use imagevol::modules::mount::{bind_options, parse_options};
use libfuzzer_sys::fuzz_target;
use nix::mount::MsFlags;

#[derive(Arbitrary, Debug)]
struct Input {
    read_only: bool,
    extra_flags: Vec<String>,
}

fuzz_target!(|input: Input| {
    let options = bind_options(input.read_only, &input.extra_flags);
    let (flags, data) = parse_options(&options);

    assert!(flags.contains(MsFlags::MS_BIND));
    assert!(data.len() <= input.extra_flags.len());
    if input.read_only && !input.extra_flags.iter().any(|flag| flag == "rw") {
        assert!(flags.contains(MsFlags::MS_RDONLY));
    }
});
