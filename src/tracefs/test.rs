use super::parse_body_offset;

const EXEC_FORMAT: &str = "\
name: sched_process_exec
ID: 316
format:
\tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;
\tfield:unsigned char common_flags;\toffset:2;\tsize:1;\tsigned:0;
\tfield:unsigned char common_preempt_count;\toffset:3;\tsize:1;\tsigned:0;
\tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;

\tfield:__data_loc char[] filename;\toffset:8;\tsize:4;\tsigned:0;
\tfield:pid_t pid;\toffset:12;\tsize:4;\tsigned:1;
\tfield:pid_t old_pid;\toffset:16;\tsize:4;\tsigned:1;

print fmt: \"filename=%s pid=%d old_pid=%d\", __get_str(filename), REC->pid, REC->old_pid
";

#[test]
fn body_offset_of_mainline_format() {
    assert_eq!(parse_body_offset(EXEC_FORMAT), Some(8));
}

#[test]
fn body_offset_of_vendor_format() {
    let vendor = EXEC_FORMAT.replace("offset:8;", "offset:16;");
    assert_eq!(parse_body_offset(&vendor), Some(16));
}

#[test]
fn body_offset_needs_a_blank_separator() {
    let squashed: String = EXEC_FORMAT
        .lines()
        .filter(|l| !l.is_empty())
        .map(|l| format!("{l}\n"))
        .collect();
    assert_eq!(parse_body_offset(&squashed), None);
}
