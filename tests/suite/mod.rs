mod end_to_end;
mod host_process;
